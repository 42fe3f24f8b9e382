pub mod password;
pub mod tokens;
pub mod validation;

pub use password::{hash_password, verify_dummy, verify_password, Password, PasswordHashString};
pub use tokens::{constant_time_eq, generate_numeric_code, generate_token, sha256_hex};
pub use validation::ValidatedJson;
