//! SIP request and response builders for the user agent

use super::auth::AuthorizationHeader;
use super::dialog::{generate_branch, DialogContext, RegistrationContext};
use super::message::{ParsedMessage, SipMessage, SipMethod};

pub const MAX_FORWARDS: &str = "70";
pub const ALLOW: &str = "INVITE,ACK,BYE,CANCEL,OPTIONS,MESSAGE,INFO,UPDATE,REFER,NOTIFY";
pub const REGISTER_SUPPORTED: &str = "path,outbound,gruu";
pub const INVITE_SUPPORTED: &str = "100rel,timer,replaces,norefersub";

/// Who we are on the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub username: String,
    pub domain: String,
    pub display_name: String,
    /// Per-connection `<random>.invalid` host for Via and Contact
    pub via_host: String,
    pub user_agent: String,
}

impl LocalEndpoint {
    /// Address of record, `sip:user@domain`
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    pub fn contact(&self) -> String {
        format!("<sip:{}@{};transport=ws>", self.username, self.via_host)
    }

    pub fn via(&self, branch: &str) -> String {
        format!("SIP/2.0/WSS {};branch={};rport", self.via_host, branch)
    }

    /// From value for a new outgoing call, without tag
    pub fn caller_identity(&self) -> String {
        if self.display_name.is_empty() {
            format!("<{}>", self.aor())
        } else {
            format!("\"{}\" <{}>", self.display_name.replace('"', ""), self.aor())
        }
    }

    /// Target URI of an outgoing call or transfer
    pub fn target_uri(&self, number: &str) -> String {
        if number.starts_with("sip:") || number.starts_with("sips:") {
            number.to_string()
        } else {
            format!("sip:{}@{}", number, self.domain)
        }
    }

    /// Request-URI of REGISTER
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.domain)
    }
}

fn with_auth(message: SipMessage, auth: Option<&AuthorizationHeader>) -> SipMessage {
    match auth {
        Some(auth) => message.header(auth.name, auth.value.clone()),
        None => message,
    }
}

/// REGISTER (or un-REGISTER with `expires == 0`)
pub fn register(
    local: &LocalEndpoint,
    context: &RegistrationContext,
    cseq: u32,
    expires: u32,
    auth: Option<&AuthorizationHeader>,
) -> SipMessage {
    let aor = format!("<{}>", local.aor());
    let message = SipMessage::request(SipMethod::Register, local.registrar_uri())
        .header("Via", local.via(&generate_branch()))
        .header("Max-Forwards", MAX_FORWARDS)
        .header("To", aor.clone())
        .header("From", format!("{};tag={}", aor, context.from_tag))
        .header("Call-ID", context.call_id.clone())
        .header("CSeq", format!("{} REGISTER", cseq))
        .header("Contact", format!("{};expires={}", local.contact(), expires))
        .header("Expires", expires.to_string())
        .header("Allow", ALLOW)
        .header("Supported", REGISTER_SUPPORTED)
        .header("User-Agent", local.user_agent.clone());
    with_auth(message, auth)
}

/// Initial INVITE or re-INVITE on the dialog's current INVITE transaction
pub fn invite(
    local: &LocalEndpoint,
    dialog: &DialogContext,
    sdp: &str,
    auth: Option<&AuthorizationHeader>,
) -> SipMessage {
    let message = SipMessage::request(SipMethod::Invite, dialog.request_uri())
        .header("Via", local.via(&dialog.invite_branch))
        .header("Max-Forwards", MAX_FORWARDS)
        .header("From", dialog.from_header())
        .header("To", dialog.to_header())
        .header("Call-ID", dialog.call_id.clone())
        .header("CSeq", format!("{} INVITE", dialog.invite_cseq))
        .header("Contact", local.contact())
        .header("Allow", ALLOW)
        .header("Supported", INVITE_SUPPORTED)
        .header("User-Agent", local.user_agent.clone());
    with_auth(message, auth).body("application/sdp", sdp)
}

/// ACK for a 2xx: new transaction, fresh branch
pub fn ack(local: &LocalEndpoint, dialog: &DialogContext) -> SipMessage {
    ack_for_cseq(local, dialog, dialog.invite_cseq)
}

/// ACK for a 2xx to an earlier INVITE of the dialog
pub fn ack_for_cseq(local: &LocalEndpoint, dialog: &DialogContext, cseq: u32) -> SipMessage {
    ack_with_branch(local, dialog, &generate_branch(), cseq)
}

/// ACK for a non-2xx final response: same branch as the INVITE
pub fn ack_non_2xx(local: &LocalEndpoint, dialog: &DialogContext) -> SipMessage {
    ack_with_branch(local, dialog, &dialog.invite_branch, dialog.invite_cseq)
}

fn ack_with_branch(
    local: &LocalEndpoint,
    dialog: &DialogContext,
    branch: &str,
    cseq: u32,
) -> SipMessage {
    SipMessage::request(SipMethod::Ack, dialog.request_uri())
        .header("Via", local.via(branch))
        .header("Max-Forwards", MAX_FORWARDS)
        .header("From", dialog.from_header())
        .header("To", dialog.to_header())
        .header("Call-ID", dialog.call_id.clone())
        .header("CSeq", format!("{} ACK", cseq))
        .header("User-Agent", local.user_agent.clone())
}

/// CANCEL matching the pending INVITE transaction
pub fn cancel(local: &LocalEndpoint, dialog: &DialogContext) -> SipMessage {
    SipMessage::request(SipMethod::Cancel, dialog.request_uri())
        .header("Via", local.via(&dialog.invite_branch))
        .header("Max-Forwards", MAX_FORWARDS)
        .header("From", dialog.from_header())
        .header("To", dialog.remote.clone())
        .header("Call-ID", dialog.call_id.clone())
        .header("CSeq", format!("{} CANCEL", dialog.invite_cseq))
        .header("User-Agent", local.user_agent.clone())
}

/// Generic in-dialog request (BYE, INFO, REFER, ...)
pub fn in_dialog(
    local: &LocalEndpoint,
    dialog: &DialogContext,
    method: SipMethod,
    cseq: u32,
) -> SipMessage {
    SipMessage::request(method, dialog.request_uri())
        .header("Via", local.via(&generate_branch()))
        .header("Max-Forwards", MAX_FORWARDS)
        .header("From", dialog.from_header())
        .header("To", dialog.to_header())
        .header("Call-ID", dialog.call_id.clone())
        .header("CSeq", format!("{} {}", cseq, method))
        .header("Contact", local.contact())
        .header("User-Agent", local.user_agent.clone())
}

pub fn bye(local: &LocalEndpoint, dialog: &DialogContext, cseq: u32) -> SipMessage {
    in_dialog(local, dialog, SipMethod::Bye, cseq)
}

/// DTMF via SIP INFO, `application/dtmf-relay`
pub fn dtmf_info(local: &LocalEndpoint, dialog: &DialogContext, cseq: u32, digit: char) -> SipMessage {
    in_dialog(local, dialog, SipMethod::Info, cseq).body(
        "application/dtmf-relay",
        format!("Signal={}\r\nDuration=160\r\n", digit),
    )
}

/// Blind transfer
pub fn refer(local: &LocalEndpoint, dialog: &DialogContext, cseq: u32, target: &str) -> SipMessage {
    in_dialog(local, dialog, SipMethod::Refer, cseq)
        .header("Refer-To", format!("<{}>", local.target_uri(target)))
        .header("Referred-By", format!("<{}>", local.aor()))
}

/// Response to a received request. Via, From, To, Call-ID and CSeq are
/// copied; `to_tag` is added to To when the request had none.
pub fn response(
    request: &ParsedMessage,
    code: u16,
    to_tag: Option<&str>,
    user_agent: &str,
) -> SipMessage {
    let mut message = SipMessage::response(code);
    for name in ["via", "from"] {
        if let Some(value) = request.header(name) {
            message = message.header(header_case(name), value);
        }
    }
    if let Some(to) = request.header("to") {
        let to = match (request.to_tag(), to_tag) {
            (None, Some(tag)) => format!("{};tag={}", to, tag),
            _ => to.to_string(),
        };
        message = message.header("To", to);
    }
    for name in ["call-id", "cseq"] {
        if let Some(value) = request.header(name) {
            message = message.header(header_case(name), value);
        }
    }
    message.header("User-Agent", user_agent)
}

fn header_case(name: &str) -> &'static str {
    match name {
        "via" => "Via",
        "from" => "From",
        "call-id" => "Call-ID",
        "cseq" => "CSeq",
        _ => "X-Unknown",
    }
}
