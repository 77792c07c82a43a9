use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::fetch::FetchResult;

const CAPTCHA_PATTERNS: &[&str] = &[
    "g-recaptcha",
    "grecaptcha",
    "hcaptcha",
    "cf-turnstile",
    "captcha-container",
    "please verify you are a human",
    "prove you're not a robot",
    "complete the security check",
];

const JS_CHALLENGE_PATTERNS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_prog",
    "challenge-platform",
    "just a moment...",
    "checking your browser",
    "please wait while we verify",
    "__cf_chl_rt_tk",
    "jschl-answer",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit exceeded",
    "you have been rate limited",
    "slow down",
    "try again later",
];

const GEO_BLOCK_PATTERNS: &[&str] = &[
    "not available in your region",
    "not available in your country",
    "geo-restricted",
    "access denied based on your location",
];

const LOGIN_REQUIRED_PATTERNS: &[&str] = &[
    "sign in to continue",
    "login required",
    "please log in",
    "create an account",
];

/// Why a response should be treated as a denial of access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    None,
    Captcha,
    JavaScriptChallenge,
    RateLimitPage,
    GeoBlocked,
    LoginRequired,
    ServiceUnavailable,
    AccessDenied,
}

impl BlockReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Captcha => "captcha",
            Self::JavaScriptChallenge => "javascript_challenge",
            Self::RateLimitPage => "rate_limit_page",
            Self::GeoBlocked => "geo_blocked",
            Self::LoginRequired => "login_required",
            Self::ServiceUnavailable => "service_unavailable",
            Self::AccessDenied => "access_denied",
        }
    }

    /// Whether a cooldown may resolve the block without operator action.
    pub const fn is_recoverable(self) -> bool {
        !matches!(
            self,
            Self::JavaScriptChallenge | Self::GeoBlocked | Self::LoginRequired
        )
    }

    /// Soft blocks that warrant an escalating cooldown like a 403.
    pub const fn escalates(self) -> bool {
        matches!(self, Self::Captcha | Self::RateLimitPage)
    }
}

impl Display for BlockReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a completed exchange. Body patterns only apply to HTML.
pub fn detect(result: &FetchResult) -> BlockReason {
    if matches!(result.status, 401 | 403) {
        return BlockReason::AccessDenied;
    }

    if result.is_html() {
        let content = result.text().to_lowercase();
        let checks = [
            (CAPTCHA_PATTERNS, BlockReason::Captcha),
            (JS_CHALLENGE_PATTERNS, BlockReason::JavaScriptChallenge),
            (RATE_LIMIT_PATTERNS, BlockReason::RateLimitPage),
            (GEO_BLOCK_PATTERNS, BlockReason::GeoBlocked),
            (LOGIN_REQUIRED_PATTERNS, BlockReason::LoginRequired),
        ];
        for (patterns, reason) in checks {
            if patterns.iter().any(|pattern| content.contains(pattern)) {
                return reason;
            }
        }
    }

    if result.status == 503 {
        return BlockReason::ServiceUnavailable;
    }

    BlockReason::None
}
