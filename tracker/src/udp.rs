//! UDP tracker client (BEP 15).

use super::{TrackerClient, TrackerError, TrackerEvent, TrackerRequest, TrackerResponse};
use crate::parse_compact_peers;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Cursor, Write};
use std::net::UdpSocket;
use std::time::Duration;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

pub struct UdpTracker {
    url: String,
}

impl UdpTracker {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl TrackerClient for UdpTracker {
    /// Connect transaction followed by an announce transaction.
    fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let url = url::Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::Protocol("missing host".into()))?;
        let port = url
            .port()
            .ok_or_else(|| TrackerError::Protocol("missing port".into()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(Duration::from_secs(15)))?;
        socket.connect((host, port))?;

        let mut rng = rand::rng();

        let transaction_id: u32 = rng.random();
        let mut connect_req = Vec::with_capacity(16);
        connect_req.write_u64::<BigEndian>(PROTOCOL_ID)?;
        connect_req.write_u32::<BigEndian>(ACTION_CONNECT)?;
        connect_req.write_u32::<BigEndian>(transaction_id)?;
        socket.send(&connect_req)?;

        let mut buf = [0u8; 16];
        let amt = socket.recv(&mut buf)?;
        let connection_id = parse_connect_response(&buf[..amt], transaction_id)?;

        let transaction_id: u32 = rng.random();
        let announce_req = encode_announce(request, connection_id, transaction_id, rng.random())?;
        socket.send(&announce_req)?;

        let mut buf = [0u8; 4096];
        let amt = socket.recv(&mut buf)?;
        parse_announce_response(&buf[..amt], transaction_id)
    }
}

fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    if buf.len() < 16 {
        return Err(TrackerError::Protocol("short connect response".into()));
    }
    let mut rdr = Cursor::new(buf);
    let action = rdr.read_u32::<BigEndian>()?;
    let echoed = rdr.read_u32::<BigEndian>()?;
    if echoed != transaction_id {
        return Err(TrackerError::Protocol("transaction id mismatch".into()));
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::Protocol(format!(
            "expected connect action, got {action}"
        )));
    }
    Ok(rdr.read_u64::<BigEndian>()?)
}

fn encode_announce(
    request: &TrackerRequest,
    connection_id: u64,
    transaction_id: u32,
    key: u32,
) -> Result<Vec<u8>, TrackerError> {
    let event_id = match request.event {
        None => 0,
        Some(TrackerEvent::Completed) => 1,
        Some(TrackerEvent::Started) => 2,
        Some(TrackerEvent::Stopped) => 3,
    };
    let mut out = Vec::with_capacity(98);
    out.write_u64::<BigEndian>(connection_id)?;
    out.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    out.write_u32::<BigEndian>(transaction_id)?;
    out.write_all(&request.info_hash)?;
    out.write_all(&request.peer_id)?;
    out.write_u64::<BigEndian>(request.downloaded)?;
    out.write_u64::<BigEndian>(request.left)?;
    out.write_u64::<BigEndian>(request.uploaded)?;
    out.write_u32::<BigEndian>(event_id)?;
    out.write_u32::<BigEndian>(0)?; // ip: let the tracker use the source address
    out.write_u32::<BigEndian>(key)?;
    out.write_i32::<BigEndian>(request.numwant.map(|n| n as i32).unwrap_or(-1))?;
    out.write_u16::<BigEndian>(request.port)?;
    Ok(out)
}

fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<TrackerResponse, TrackerError> {
    if buf.len() < 8 {
        return Err(TrackerError::Protocol("short announce response".into()));
    }
    let mut rdr = Cursor::new(buf);
    let action = rdr.read_u32::<BigEndian>()?;
    let echoed = rdr.read_u32::<BigEndian>()?;
    if echoed != transaction_id {
        return Err(TrackerError::Protocol("transaction id mismatch".into()));
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(&buf[8..]).into_owned(),
        ));
    }
    if action != ACTION_ANNOUNCE || buf.len() < 20 {
        return Err(TrackerError::Protocol(format!(
            "unexpected announce reply (action {action}, {} bytes)",
            buf.len()
        )));
    }
    let interval = rdr.read_u32::<BigEndian>()?;
    let leechers = rdr.read_u32::<BigEndian>()?;
    let seeders = rdr.read_u32::<BigEndian>()?;

    Ok(TrackerResponse {
        interval,
        peers: parse_compact_peers(&buf[20..]),
        complete: Some(seeders),
        incomplete: Some(leechers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_response() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        buf.write_u32::<BigEndian>(7).unwrap();
        buf.write_u64::<BigEndian>(0xdead_beef).unwrap();
        assert_eq!(parse_connect_response(&buf, 7).unwrap(), 0xdead_beef);
        assert!(parse_connect_response(&buf, 8).is_err());
    }

    #[test]
    fn test_announce_request_layout() {
        let request = TrackerRequest {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 18,
            event: Some(TrackerEvent::Started),
            numwant: None,
        };
        let out = encode_announce(&request, 42, 9, 5).unwrap();
        assert_eq!(out.len(), 98);
        assert_eq!(&out[16..36], &[1; 20]);
        assert_eq!(&out[80..84], &2u32.to_be_bytes());
        assert_eq!(&out[92..96], &(-1i32).to_be_bytes());
        assert_eq!(&out[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_announce_response_and_error() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        buf.write_u32::<BigEndian>(3).unwrap();
        buf.write_u32::<BigEndian>(900).unwrap();
        buf.write_u32::<BigEndian>(1).unwrap();
        buf.write_u32::<BigEndian>(2).unwrap();
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        let resp = parse_announce_response(&buf, 3).unwrap();
        assert_eq!(resp.interval, 900);
        assert_eq!(resp.complete, Some(2));
        assert_eq!(resp.incomplete, Some(1));
        assert_eq!(resp.peers.len(), 1);

        let mut err = Vec::new();
        err.write_u32::<BigEndian>(ACTION_ERROR).unwrap();
        err.write_u32::<BigEndian>(3).unwrap();
        err.extend_from_slice(b"banned");
        assert!(matches!(
            parse_announce_response(&err, 3),
            Err(TrackerError::Failure(msg)) if msg == "banned"
        ));
    }
}
