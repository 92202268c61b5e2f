//! Session constants
//!
//! Store keys are the persisted contract: changing one orphans data written by
//! earlier versions of the app.

use std::time::Duration;

/// Current access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Current refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Serialized `UserRecord`
pub const USER_INFO_KEY: &str = "userInfo";

/// Serialized profile (opaque JSON)
pub const PROFILE_KEY: &str = "profile";

/// Access token expiry, string-encoded unix milliseconds
pub const TOKEN_EXPIRY_KEY: &str = "tokenExpiry";

/// Every key owned by a session. Cleared together on logout.
pub const SESSION_KEYS: &[&str] = &[
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    USER_INFO_KEY,
    PROFILE_KEY,
    TOKEN_EXPIRY_KEY,
];

/// Lifetime assumed for every issued or refreshed access token.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Tokens with less than this remaining are treated as expired.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Default auth endpoint paths, relative to the API base URL
pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const REFRESH_PATH: &str = "/auth/refresh-token";

/// Server messages that mean the refresh token itself is dead. Matched
/// case-insensitively against the `message` field of a failed refresh.
pub const INVALID_REFRESH_PATTERNS: &[&str] = &[
    "invalid refresh token",
    "refresh token expired",
    "expired refresh token",
    "refresh token is invalid",
    "refresh token has expired",
    "invalid_grant",
];
