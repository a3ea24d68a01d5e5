// src/payment/location.rs
//! The application's address bar

use anyhow::{Context, Result};
use reqwest::Url;
use std::sync::Mutex;

pub const ORDER_ID_PARAM: &str = "order_id";

pub trait AppLocation: Send + Sync {
    fn current(&self) -> Url;
    /// Replace the address without navigating.
    fn replace(&self, url: Url);
}

pub struct MemoryLocation {
    url: Mutex<Url>,
}

impl MemoryLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid application URL: {}", url))?;
        Ok(Self {
            url: Mutex::new(url),
        })
    }
}

impl AppLocation for MemoryLocation {
    fn current(&self) -> Url {
        self.url.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, url: Url) {
        *self.url.lock().unwrap_or_else(|e| e.into_inner()) = url;
    }
}

/// Remove `order_id` from the address bar and return its value. Other query
/// parameters are kept in order; an emptied query string is dropped entirely.
pub fn take_order_id(location: &dyn AppLocation) -> Option<String> {
    let mut url = location.current();

    let mut order_id = None;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(key, value)| {
            if key == ORDER_ID_PARAM {
                if order_id.is_none() && !value.trim().is_empty() {
                    order_id = Some(value.trim().to_string());
                }
                false
            } else {
                true
            }
        })
        .collect();

    if url.query().is_none() || kept.len() == url.query_pairs().count() {
        return None;
    }

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    location.replace(url);

    order_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_order_id_strips_param() {
        let location = MemoryLocation::parse("https://app.example/resume-generator?order_id=o1").unwrap();
        assert_eq!(take_order_id(&location).as_deref(), Some("o1"));
        assert_eq!(
            location.current().as_str(),
            "https://app.example/resume-generator"
        );
        assert_eq!(take_order_id(&location), None);
    }

    #[test]
    fn test_take_order_id_keeps_other_params() {
        let location =
            MemoryLocation::parse("https://app.example/premium?tab=tools&order_id=o9&ref=mail").unwrap();
        assert_eq!(take_order_id(&location).as_deref(), Some("o9"));
        assert_eq!(
            location.current().as_str(),
            "https://app.example/premium?tab=tools&ref=mail"
        );
    }

    #[test]
    fn test_blank_order_id_is_consumed_but_ignored() {
        let location = MemoryLocation::parse("https://app.example/?order_id=").unwrap();
        assert_eq!(take_order_id(&location), None);
        assert_eq!(location.current().query(), None);
    }

    #[test]
    fn test_no_query_leaves_url_alone() {
        let location = MemoryLocation::parse("https://app.example/find-jobs").unwrap();
        assert_eq!(take_order_id(&location), None);
        assert_eq!(location.current().as_str(), "https://app.example/find-jobs");
    }
}
