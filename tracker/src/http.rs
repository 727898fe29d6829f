//! HTTP tracker client.

use super::{TrackerClient, TrackerError, TrackerEvent, TrackerRequest, TrackerResponse};
use crate::parse_compact_peers;
use std::net::{Ipv4Addr, SocketAddrV4};
use tds_core::bencoding::{Bencode, Decoder};

/// Client for HTTP/HTTPS announce endpoints.
pub struct HttpTracker {
    url: String,
}

impl HttpTracker {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    /// Full announce URL for `request`. The info-hash and peer id are raw
    /// bytes, so they are percent-encoded by hand rather than as UTF-8 pairs.
    pub fn announce_url(&self, request: &TrackerRequest) -> String {
        let info_hash = form_urlencoded::byte_serialize(&request.info_hash).collect::<String>();
        let peer_id = form_urlencoded::byte_serialize(&request.peer_id).collect::<String>();

        let mut params = form_urlencoded::Serializer::new(String::new());
        params
            .append_pair("port", &request.port.to_string())
            .append_pair("uploaded", &request.uploaded.to_string())
            .append_pair("downloaded", &request.downloaded.to_string())
            .append_pair("left", &request.left.to_string())
            .append_pair("compact", "1");
        if let Some(event) = request.event {
            let event = match event {
                TrackerEvent::Started => "started",
                TrackerEvent::Stopped => "stopped",
                TrackerEvent::Completed => "completed",
            };
            params.append_pair("event", event);
        }
        if let Some(numwant) = request.numwant {
            params.append_pair("numwant", &numwant.to_string());
        }

        let separator = if self.url.contains('?') { "&" } else { "?" };
        format!(
            "{}{separator}info_hash={info_hash}&peer_id={peer_id}&{}",
            self.url,
            params.finish()
        )
    }
}

impl TrackerClient for HttpTracker {
    /// Blocking GET; callers run this on a blocking task.
    fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let body = reqwest::blocking::get(self.announce_url(request))?.bytes()?;
        parse_http_response(&body)
    }
}

pub(crate) fn parse_http_response(body: &[u8]) -> Result<TrackerResponse, TrackerError> {
    let root = Decoder::new(body).decode_value()?;
    if !matches!(root, Bencode::Dict(_)) {
        return Err(TrackerError::Protocol("response is not a dictionary".into()));
    }
    if let Some(reason) = root.get(b"failure reason").and_then(Bencode::as_string) {
        return Err(TrackerError::Failure(reason));
    }

    let interval = root
        .get(b"interval")
        .and_then(Bencode::as_int)
        .ok_or_else(|| TrackerError::Protocol("missing interval".into()))? as u32;
    let count = |key: &[u8]| root.get(key).and_then(Bencode::as_int).map(|n| n as u32);

    let peers = match root.get(b"peers") {
        Some(Bencode::Bytes(compact)) => parse_compact_peers(compact),
        Some(Bencode::List(list)) => list.iter().filter_map(dictionary_peer).collect(),
        _ => Vec::new(),
    };

    Ok(TrackerResponse {
        interval,
        peers,
        complete: count(&b"complete"[..]),
        incomplete: count(&b"incomplete"[..]),
    })
}

fn dictionary_peer(entry: &Bencode) -> Option<SocketAddrV4> {
    let ip: Ipv4Addr = entry.get(b"ip")?.as_string()?.parse().ok()?;
    let port = u16::try_from(entry.get(b"port")?.as_int()?).ok()?;
    Some(SocketAddrV4::new(ip, port))
}
