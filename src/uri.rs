//! Parsing for the `nsq://` and `nsqlookup://` connection string forms.

use url::Url;

use crate::error::{Error, Result};

/// A parsed `nsq://host:port[/topic][?opt=...]` target — a single `nsqd`
/// instance, used by [`crate::publisher::Publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqdTarget {
    /// TCP host.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Topic taken from the URI path, if present.
    pub topic: Option<String>,
}

/// A parsed `nsqlookup://host:port[,host:port...][/topic][?channel=...]`
/// target — one or more `nsqlookupd` instances, used by
/// [`crate::subscriber::Subscriber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTarget {
    /// `http://host:port` base URLs for each lookup instance.
    pub bases: Vec<String>,
    /// Topic taken from the URI path, if present.
    pub topic: Option<String>,
    /// Channel taken from the `channel` query parameter, if present.
    pub channel: Option<String>,
    /// Whether the `ssl` query flag was present. Connection-level TLS
    /// negotiation itself is out of scope (spec.md §1); this is carried
    /// through for callers that want to reject or warn on it.
    pub ssl: bool,
}

/// Parse a direct `nsq://host:port[/topic][?opt=...]` publisher target.
pub fn parse_nsqd_uri(uri: &str) -> Result<NsqdTarget> {
    let parsed = Url::parse(uri).map_err(|e| {
        Error::InvalidInvocation(format!("invalid nsq:// URI {uri:?}: {e}"))
    })?;
    if parsed.scheme() != "nsq" {
        return Err(Error::InvalidInvocation(format!(
            "expected nsq:// scheme, got {:?}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidInvocation(format!("missing host in {uri:?}")))?
        .to_string();
    let port = parsed
        .port()
        .ok_or_else(|| Error::InvalidInvocation(format!("missing port in {uri:?}")))?;
    let topic = first_path_segment(&parsed);
    Ok(NsqdTarget { host, port, topic })
}

/// Parse an `nsqlookup://host:port[,host:port...][/topic][?channel=...]`
/// discovery target. `url` cannot represent a comma-separated authority, so
/// the host list is split out manually before delegating path/query
/// parsing to `url` against a placeholder single host.
pub fn parse_lookup_uri(uri: &str) -> Result<LookupTarget> {
    let rest = uri.strip_prefix("nsqlookup://").ok_or_else(|| {
        Error::InvalidInvocation(format!("expected nsqlookup:// scheme in {uri:?}"))
    })?;
    let split_at = rest.find(['/', '?']).unwrap_or(rest.len());
    let (hosts_part, remainder) = rest.split_at(split_at);

    let bases: Vec<String> = hosts_part
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|hostport| format!("http://{hostport}"))
        .collect();
    if bases.is_empty() {
        return Err(Error::InvalidInvocation(format!(
            "no lookup hosts in {uri:?}"
        )));
    }

    let (topic, channel, ssl) = if remainder.is_empty() {
        (None, None, false)
    } else {
        let placeholder = Url::parse(&format!("http://placeholder{remainder}"))
            .map_err(|e| Error::InvalidInvocation(format!("invalid nsqlookup:// URI {uri:?}: {e}")))?;
        let topic = first_path_segment(&placeholder);
        let mut channel = None;
        let mut ssl = false;
        for (key, value) in placeholder.query_pairs() {
            match key.as_ref() {
                "channel" => channel = Some(value.into_owned()),
                "ssl" => ssl = true,
                _ => {}
            }
        }
        (topic, channel, ssl)
    };

    Ok(LookupTarget {
        bases,
        topic,
        channel,
        ssl,
    })
}

fn first_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?.find(|s| !s.is_empty()).map(str::to_string)
}
