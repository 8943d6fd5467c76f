use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Key '{}' does not exist", key))]
    KeyNotFound { key: String },

    #[snafu(display("Distributed lock already held; lease expires in {}ms", remaining_ms))]
    LockHeld { remaining_ms: u128 },

    #[snafu(display("Distributed lock released without being held"))]
    NotLocked,
}
