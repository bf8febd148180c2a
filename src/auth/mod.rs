pub mod jwt;
pub mod password;
pub mod session;
pub mod tokens;

pub use jwt::JwtKeys;
pub use session::AuthUser;
