//! Kernel command line parsing: the alternative configuration carrier for
//! the emulated machines.

use std::collections::BTreeMap;

use thiserror::Error;
use url::Url;

/// Kernel parameter carrying the overlay join URL.
pub const SIDEROLINK_PARAM: &str = "siderolink.api";
/// Kernel parameter carrying the event sink address.
pub const EVENTS_SINK_PARAM: &str = "talos.events.sink";
/// Kernel parameter carrying the kernel log receiver address.
pub const LOGGING_KERNEL_PARAM: &str = "talos.logging.kernel";

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed {0} url: {1}")]
    MalformedUrl(&'static str, #[source] url::ParseError),
}

/// Split a kernel command line into key/value parameters. Parameters without
/// `=` map to an empty value; later occurrences win.
pub fn parse(cmdline: &str) -> BTreeMap<String, String> {
    cmdline
        .split_whitespace()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (arg.to_string(), String::new()),
        })
        .collect()
}

/// Overlay join parameters extracted from the siderolink URL. The URL may
/// carry `?jointoken=<t>` and `?grpc_tunnel=true`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SideroLinkParams {
    pub api_endpoint: String,
    pub join_token: Option<String>,
    pub tunnel: bool,
}

impl SideroLinkParams {
    pub fn from_url(raw: &str) -> Result<Self, Error> {
        let url = Url::parse(raw).map_err(|e| Error::MalformedUrl(SIDEROLINK_PARAM, e))?;

        let mut join_token = None;
        let mut tunnel = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "jointoken" => join_token = Some(value.into_owned()),
                "grpc_tunnel" => tunnel = value == "true",
                _ => {}
            }
        }

        let mut api_endpoint = url.clone();
        api_endpoint.set_query(None);

        Ok(Self {
            api_endpoint: api_endpoint.to_string(),
            join_token,
            tunnel,
        })
    }
}

/// Machine configuration carried on the kernel command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelConfig {
    pub siderolink: Option<SideroLinkParams>,
    pub event_sink_endpoint: Option<String>,
    pub log_receiver_endpoint: Option<String>,
}

impl KernelConfig {
    pub fn from_cmdline(cmdline: &str) -> Result<Self, Error> {
        let params = parse(cmdline);

        let siderolink = params
            .get(SIDEROLINK_PARAM)
            .map(|raw| SideroLinkParams::from_url(raw))
            .transpose()?;

        Ok(Self {
            siderolink,
            event_sink_endpoint: params.get(EVENTS_SINK_PARAM).cloned(),
            log_receiver_endpoint: params.get(LOGGING_KERNEL_PARAM).cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_pairs() {
        let params = parse("console=ttyS0 talemu=1 talos.events.sink=10.0.0.1:8090");
        assert_eq!(params.get("talemu").map(String::as_str), Some("1"));
        assert_eq!(params.get("console").map(String::as_str), Some("ttyS0"));
        assert_eq!(
            params.get(EVENTS_SINK_PARAM).map(String::as_str),
            Some("10.0.0.1:8090")
        );
    }

    #[test]
    fn test_siderolink_url_with_token_and_tunnel() {
        let params = SideroLinkParams::from_url(
            "grpc://10.5.0.2:8090?jointoken=w7uVuW3zbVKIYQuzEcyetAHeYMeo&grpc_tunnel=true",
        )
        .unwrap();
        assert_eq!(params.api_endpoint, "grpc://10.5.0.2:8090");
        assert_eq!(
            params.join_token.as_deref(),
            Some("w7uVuW3zbVKIYQuzEcyetAHeYMeo")
        );
        assert!(params.tunnel);
    }

    #[test]
    fn test_kernel_config_full_cmdline() {
        let config = KernelConfig::from_cmdline(
            "siderolink.api=https://siderolink.example:443?jointoken=abc \
             talos.events.sink=[fdae::1]:8090 talos.logging.kernel=tcp://10.0.0.1:8092",
        )
        .unwrap();

        let siderolink = config.siderolink.unwrap();
        assert_eq!(siderolink.api_endpoint, "https://siderolink.example/");
        assert_eq!(siderolink.join_token.as_deref(), Some("abc"));
        assert!(!siderolink.tunnel);
        assert_eq!(
            config.event_sink_endpoint.as_deref(),
            Some("[fdae::1]:8090")
        );
        assert_eq!(
            config.log_receiver_endpoint.as_deref(),
            Some("tcp://10.0.0.1:8092")
        );
    }

    #[test]
    fn test_kernel_config_empty() {
        let config = KernelConfig::from_cmdline("").unwrap();
        assert_eq!(config, KernelConfig::default());
    }
}
