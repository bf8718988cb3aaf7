//! Route fingerprinting
//!
//! Maps a concrete request path onto the key used to share rate-limit
//! budgets before the service has revealed a bucket id.

use std::fmt;

/// HTTP methods the client issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Uppercase wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Parse from the uppercase wire name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete request route: method plus service-relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub method: Method,
    pub path: String,
}

impl Route {
    /// Create a route; the path is relative to the API base URL
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = path.trim_start_matches('/').to_string();
        Self { method, path }
    }

    /// Compute the budget-sharing key for this route
    ///
    /// The first id following a top-level resource segment stays literal;
    /// every other numeric id collapses into a placeholder, so
    /// `channels/123/messages/456` and `channels/123/messages/789` share one
    /// fingerprint while `channels/999/...` does not.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut normalized = String::with_capacity(self.path.len());
        let mut major_kept = false;
        let mut prev_top_level = false;

        for (i, segment) in self.path.split('/').enumerate() {
            if i > 0 {
                normalized.push('/');
            }
            let is_id = !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit());
            if is_id {
                if prev_top_level && !major_kept {
                    major_kept = true;
                    normalized.push_str(segment);
                } else {
                    normalized.push_str("{id}");
                }
            } else {
                normalized.push_str(segment);
            }
            prev_top_level = matches!(segment, "channels" | "guilds" | "webhooks");
        }

        Fingerprint(format!("{}:{}", self.method.as_str(), normalized))
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} /{}", self.method, self.path)
    }
}

/// Budget-sharing key computed from a route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The normalized `METHOD:path` form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_share_a_fingerprint() {
        let a = Route::new(Method::Get, "channels/100/messages/200").fingerprint();
        let b = Route::new(Method::Get, "channels/100/messages/999").fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET:channels/100/messages/{id}");
    }

    #[test]
    fn test_channels_do_not_share() {
        let a = Route::new(Method::Get, "channels/100/messages/200").fingerprint();
        let b = Route::new(Method::Get, "channels/101/messages/200").fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn test_method_distinguishes() {
        let get = Route::new(Method::Get, "channels/100/messages/200").fingerprint();
        let del = Route::new(Method::Delete, "channels/100/messages/200").fingerprint();
        assert_ne!(get, del);
    }

    #[test]
    fn test_guild_major_id_kept() {
        let fp = Route::new(Method::Patch, "guilds/42/members/77").fingerprint();
        assert_eq!(fp.as_str(), "PATCH:guilds/42/members/{id}");
    }

    #[test]
    fn test_leading_slash_stripped() {
        let a = Route::new(Method::Get, "/gateway/bot").fingerprint();
        let b = Route::new(Method::Get, "gateway/bot").fingerprint();
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_numeric_segments_literal() {
        let fp = Route::new(Method::Post, "webhooks/31/some-token").fingerprint();
        assert_eq!(fp.as_str(), "POST:webhooks/31/some-token");
    }
}
