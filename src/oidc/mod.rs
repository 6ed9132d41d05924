//! OpenID Connect support: endpoint layout, JWKS key resolution and JWT
//! verification.

pub mod endpoints;
pub mod jwks;
pub mod jwt;

pub use endpoints::{OidcEndpoints, redirect_uri};
pub use jwks::{JwksKeyResolver, RsaPublicKey};
pub use jwt::{
    DEFAULT_USERNAME_CLAIM, FALLBACK_USERNAME, JwtValidator, UnverifiedClaims, VerifiedClaims,
    decode_payload_claim, unverified_expiry, unverified_username,
};
