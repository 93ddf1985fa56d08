//! Authentication and caller-privacy primitives.

pub mod jwt;
pub mod nonce;
pub mod phone;

pub use jwt::{Claims, JwtValidator};
pub use nonce::NonceStore;
pub use phone::{PhoneHash, hash_phone_number, mask_number, normalize_e164};
