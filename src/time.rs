/// A current time provider.
///
/// Supplies the timestamp stamped into a file header when the file is
/// closed. The default implementation reads the wall clock through the
/// `chrono` crate if the `chrono` feature is enabled and returns 0
/// otherwise.
pub trait TimeProvider {
    /// Seconds since the Unix epoch.
    fn unix_time(&self) -> u32;
}

pub(crate) struct DefaultTimeProvider {
    _dummy: (),
}

impl TimeProvider for DefaultTimeProvider {
    #[cfg(feature = "chrono")]
    fn unix_time(&self) -> u32 {
        chrono::Utc::now().timestamp() as u32
    }
    #[cfg(not(feature = "chrono"))]
    fn unix_time(&self) -> u32 {
        0
    }
}

pub(crate) static DEFAULT_TIME_PROVIDER: DefaultTimeProvider = DefaultTimeProvider { _dummy: () };
