//! SDP helpers: static fallback offer/answer and media direction edits

use std::fmt;

/// Media direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub const ALL: [MediaDirection; 4] = [
        MediaDirection::SendRecv,
        MediaDirection::SendOnly,
        MediaDirection::RecvOnly,
        MediaDirection::Inactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    /// Whether a peer offering this direction is putting us on hold
    pub fn is_remote_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }

    fn attribute(&self) -> String {
        format!("a={}", self.as_str())
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TELEPHONE_EVENT_PT: u8 = 101;

/// Static SDP used when no WebRTC session is available. Media will not flow
/// but signaling can proceed.
pub fn fallback_sdp(codecs: &[String], session_id: u64) -> String {
    let default_codecs = ["PCMU".to_string(), "PCMA".to_string()];
    let codecs = if codecs.is_empty() {
        &default_codecs[..]
    } else {
        codecs
    };

    let mut payload_types: Vec<u8> = Vec::new();
    let mut attributes: Vec<String> = Vec::new();

    for codec in codecs {
        let (pt, lines): (u8, Vec<&str>) = match codec.trim().to_ascii_uppercase().as_str() {
            "PCMU" => (0, vec!["a=rtpmap:0 PCMU/8000"]),
            "PCMA" => (8, vec!["a=rtpmap:8 PCMA/8000"]),
            "G722" => (9, vec!["a=rtpmap:9 G722/8000"]),
            "OPUS" => (
                111,
                vec![
                    "a=rtpmap:111 opus/48000/2",
                    "a=fmtp:111 minptime=10;useinbandfec=1",
                ],
            ),
            "TELEPHONE-EVENT" | "101" => (
                TELEPHONE_EVENT_PT,
                vec!["a=rtpmap:101 telephone-event/8000", "a=fmtp:101 0-16"],
            ),
            _ => continue,
        };
        if payload_types.contains(&pt) {
            continue;
        }
        payload_types.push(pt);
        attributes.extend(lines.into_iter().map(str::to_string));
    }

    if !payload_types.contains(&TELEPHONE_EVENT_PT) {
        payload_types.push(TELEPHONE_EVENT_PT);
        attributes.push("a=rtpmap:101 telephone-event/8000".to_string());
        attributes.push("a=fmtp:101 0-16".to_string());
    }

    let pts: Vec<String> = payload_types.iter().map(u8::to_string).collect();

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN IP4 0.0.0.0\r\n",
        session_id, session_id
    ));
    sdp.push_str("s=WsPhone\r\n");
    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=audio 9 UDP/TLS/RTP/SAVPF {}\r\n", pts.join(" ")));
    for line in attributes {
        sdp.push_str(&line);
        sdp.push_str("\r\n");
    }
    sdp.push_str("a=sendrecv\r\n");
    sdp.push_str("a=rtcp-mux\r\n");
    sdp.push_str("a=ptime:20\r\n");
    sdp.push_str("a=maxptime:150\r\n");
    sdp
}

/// First media direction attribute of the SDP, `sendrecv` when absent
pub fn media_direction(sdp: &str) -> MediaDirection {
    sdp.lines()
        .map(str::trim)
        .find_map(|line| {
            MediaDirection::ALL
                .into_iter()
                .find(|dir| line == dir.attribute())
        })
        .unwrap_or(MediaDirection::SendRecv)
}

/// Rewrite every direction attribute: `sendonly` for hold, `sendrecv` to
/// resume. An SDP without one gets it appended to each media section.
pub fn mutate_for_hold(sdp: &str, hold: bool) -> String {
    let target = if hold {
        MediaDirection::SendOnly
    } else {
        MediaDirection::SendRecv
    };

    let has_direction = sdp.lines().any(|line| {
        let line = line.trim();
        MediaDirection::ALL.iter().any(|dir| line == dir.attribute())
    });

    let mut out = String::with_capacity(sdp.len() + 16);
    let mut in_media = false;
    for line in sdp.lines() {
        let trimmed = line.trim_end_matches('\r');
        if !has_direction && trimmed.starts_with("m=") {
            if in_media {
                out.push_str(&target.attribute());
                out.push_str("\r\n");
            }
            in_media = true;
        }
        if MediaDirection::ALL
            .iter()
            .any(|dir| trimmed.trim() == dir.attribute())
        {
            out.push_str(&target.attribute());
        } else {
            out.push_str(trimmed);
        }
        out.push_str("\r\n");
    }
    if !has_direction && in_media {
        out.push_str(&target.attribute());
        out.push_str("\r\n");
    }
    out
}
