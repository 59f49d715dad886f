use std::time::Duration;

/// Age threshold used by [`Refreshable::refresh`].
pub const DEFAULT_REFRESH_AGE: Duration = Duration::from_secs(1);

/// Something that can be asked to refresh its data.
///
/// None of the methods wait for the refresh or report errors. They only decide
/// whether a new fetch should start, and a fetch that is already in flight is
/// never duplicated.
pub trait Refreshable: Send + Sync {
    /// Refresh if the data is older than [`DEFAULT_REFRESH_AGE`].
    fn refresh(&self) {
        self.refresh_if_older_than(DEFAULT_REFRESH_AGE);
    }

    /// Refresh if the data is older than `age`.
    fn refresh_if_older_than(&self, age: Duration);

    /// Refresh if the data has outlived the configured expiration.
    fn refresh_if_expired(&self);
}
