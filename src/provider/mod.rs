//! Subscription providers
//!
//! A subscription is a remote document listing proxy nodes, either as a
//! (usually base64 wrapped) list of share links or as a YAML document with
//! a `proxies:` sequence. Every decoded node is registered with the
//! executor, which drops duplicates by identity.

mod fetcher;
mod subscription;

pub use fetcher::Fetcher;
pub use subscription::{decode_content, SubscriptionProvider};

use serde::{Deserialize, Serialize};

/// Traffic quota advertised by the subscription server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    /// Expiration timestamp (Unix epoch)
    pub expire: u64,
}

impl SubscriptionInfo {
    /// Parse a `Subscription-Userinfo` header
    ///
    /// Format: "upload=xxx; download=xxx; total=xxx; expire=xxx"
    pub fn parse(header: &str) -> Option<Self> {
        let mut info = SubscriptionInfo::default();
        let mut seen = false;

        for part in header.split(';') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim().to_lowercase().as_str() {
                "upload" => info.upload = value,
                "download" => info.download = value,
                "total" => info.total = value,
                "expire" => info.expire = value,
                _ => continue,
            }
            seen = true;
        }

        seen.then_some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_info_parse() {
        let header = "upload=1234; download=5678; total=10000000; expire=1704067200";
        let info = SubscriptionInfo::parse(header).unwrap();

        assert_eq!(info.upload, 1234);
        assert_eq!(info.download, 5678);
        assert_eq!(info.total, 10000000);
        assert_eq!(info.expire, 1704067200);
    }

    #[test]
    fn test_subscription_info_garbage() {
        assert!(SubscriptionInfo::parse("nothing here").is_none());
        assert_eq!(
            SubscriptionInfo::parse("total=x; expire=5"),
            Some(SubscriptionInfo {
                expire: 5,
                ..Default::default()
            })
        );
    }
}
