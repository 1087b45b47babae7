use rand::Rng;
use rand::distributions::Alphanumeric;

pub const DEFAULT_PASSWORD_LENGTH: usize = 24;

/// Random alphanumeric secret, safe to place unquoted in `.env` and on a
/// shell command line.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
