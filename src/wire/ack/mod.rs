use std::fmt;

/// Per-frame acknowledgment written back to the peer as one ASCII line.
///
/// `Success` means "accepted for processing", not "durably stored".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    Success,
    BadRequest,
    AuthenticationError,
}

impl AckCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::AuthenticationError => 401,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::BadRequest => "BAD_REQUEST",
            Self::AuthenticationError => "AUTHENTICATION_ERROR",
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "200" => Some(Self::Success),
            "400" => Some(Self::BadRequest),
            "401" => Some(Self::AuthenticationError),
            _ => None,
        }
    }

    pub fn encode(self) -> Vec<u8> {
        format!("{}\n", self.code()).into_bytes()
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
