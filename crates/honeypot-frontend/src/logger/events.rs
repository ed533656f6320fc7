//! Event payloads the logger can persist.

use std::net::IpAddr;

/// One observed attacker action, timestamped at the call site (not at
/// commit time) per the session's ordering guarantee.
#[derive(Debug, Clone)]
pub enum Event {
    LoginAttempt {
        username: String,
        password: String,
    },
    PtyRequest {
        channel: u32,
        term: String,
        cols: u32,
        rows: u32,
        px_width: u32,
        px_height: u32,
    },
    EnvRequest {
        channel: u32,
        name: String,
        value: String,
    },
    DirectTcpipRequest {
        channel: u32,
        origin_ip: IpAddr,
        origin_port: u16,
        destination: String,
        destination_port: u16,
    },
    X11Request {
        channel: u32,
        single_connection: bool,
        auth_protocol: String,
        auth_cookie: String,
        screen_number: u32,
    },
    PortForwardRequest {
        address: String,
        port: u16,
    },
    Command {
        input: String,
    },
    ChannelOutput {
        channel: u32,
        data: Vec<u8>,
    },
    Download {
        data: Vec<u8>,
        mime_type: String,
        source_address: IpAddr,
        source_url: Option<String>,
        save_data: bool,
    },
}

impl Event {
    /// The `event.type` / per-type table discriminant, matching the
    /// reference logger's event-kind strings.
    pub(super) fn kind(&self) -> &'static str {
        match self {
            Event::LoginAttempt { .. } => "login_attempt",
            Event::PtyRequest { .. } => "pty_request",
            Event::EnvRequest { .. } => "env_request",
            Event::DirectTcpipRequest { .. } => "direct_tcpip_request",
            Event::X11Request { .. } => "x_eleven_request",
            Event::PortForwardRequest { .. } => "port_forward_request",
            Event::Command { .. } => "command",
            Event::ChannelOutput { .. } => "ssh_channel_output",
            Event::Download { .. } => "download",
        }
    }
}
