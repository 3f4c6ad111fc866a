use bytes::Bytes;

/// Transport-neutral websocket frame type.
///
/// Transports convert their native frame representation into/from `WsFrame`.
/// `Text` payloads are valid UTF-8 whenever they were produced by a transport or by
/// [`WsFrame::text`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<WsCloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsCloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

/// RFC 6455 normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

impl WsFrame {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn close(code: u16, reason: &'static str) -> Self {
        Self::Close(Some(WsCloseFrame {
            code,
            reason: Bytes::from_static(reason.as_bytes()),
        }))
    }

    /// Text payload as `&str`, if this is a text frame holding UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsFrame::Text(bytes) => std::str::from_utf8(bytes.as_ref()).ok(),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, WsFrame::Close(_))
    }
}
