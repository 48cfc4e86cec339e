//! Binary protocol: 24-byte headers, big-endian fields, quiet opcodes.

/// Request magic byte.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Response magic byte.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Fixed header length for both directions.
pub const HEADER_LEN: usize = 24;

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    TooLarge = 0x0003,
    InvalidArguments = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    AuthError = 0x0020,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
}

/// Request opcodes (quiet variants included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    GatK = 0x23,
    GatKQ = 0x24,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        Some(match byte {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1a => PrependQ,
            0x1c => Touch,
            0x1d => Gat,
            0x1e => GatQ,
            0x23 => GatK,
            0x24 => GatKQ,
            _ => return None,
        })
    }

    /// Quiet opcodes suppress success responses but still emit errors.
    pub fn is_quiet(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            GetQ | GetKQ
                | SetQ
                | AddQ
                | ReplaceQ
                | DeleteQ
                | IncrementQ
                | DecrementQ
                | QuitQ
                | FlushQ
                | AppendQ
                | PrependQ
                | GatQ
                | GatKQ
        )
    }

    /// Map a quiet variant to its base opcode.
    pub fn base(self) -> Self {
        use Opcode::*;
        match self {
            GetQ => Get,
            GetKQ => GetK,
            SetQ => Set,
            AddQ => Add,
            ReplaceQ => Replace,
            DeleteQ => Delete,
            IncrementQ => Increment,
            DecrementQ => Decrement,
            QuitQ => Quit,
            FlushQ => Flush,
            AppendQ => Append,
            PrependQ => Prepend,
            GatQ => Gat,
            GatKQ => GatK,
            other => other,
        }
    }

    /// GetK/GatK responses echo the key.
    pub fn returns_key(self) -> bool {
        use Opcode::*;
        matches!(self, GetK | GetKQ | GatK | GatKQ)
    }
}

/// Parsed request header (integers already in host order).
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub opcode: u8,
    pub keylen: u16,
    pub extlen: u8,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

/// Header parse failure: only a bad magic byte, which is fatal for the
/// connection.
#[derive(Debug)]
pub struct BadMagic(pub u8);

impl RequestHeader {
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, BadMagic> {
        if buf[0] != MAGIC_REQUEST {
            return Err(BadMagic(buf[0]));
        }
        Ok(Self {
            opcode: buf[1],
            keylen: u16::from_be_bytes([buf[2], buf[3]]),
            extlen: buf[4],
            // buf[5] data type and buf[6..8] vbucket are ignored.
            bodylen: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        })
    }

    /// Value length after extras and key.
    pub fn value_len(&self) -> usize {
        self.bodylen as usize - self.keylen as usize - self.extlen as usize
    }

    /// Structural sanity: key and extras must fit in the body.
    pub fn is_framed(&self) -> bool {
        self.keylen as u32 <= self.bodylen
            && self.keylen as u32 + self.extlen as u32 <= self.bodylen
    }
}

/// Build a full response frame.
pub fn response(
    opcode: u8,
    status: Status,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let bodylen = extras.len() + key.len() + value.len();
    let mut out = Vec::with_capacity(HEADER_LEN + bodylen);
    out.push(MAGIC_RESPONSE);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0); // data type
    out.extend_from_slice(&(status as u16).to_be_bytes());
    out.extend_from_slice(&(bodylen as u32).to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}

/// Human-readable error bodies, matching the classic server.
pub fn status_text(status: Status) -> &'static [u8] {
    match status {
        Status::NoError => b"",
        Status::KeyNotFound => b"Not found",
        Status::KeyExists => b"Data exists for key.",
        Status::TooLarge => b"Too large.",
        Status::InvalidArguments => b"Invalid arguments",
        Status::NotStored => b"Not stored.",
        Status::DeltaBadval => b"Non-numeric server-side value for incr or decr",
        Status::AuthError => b"Auth failure.",
        Status::UnknownCommand => b"Unknown command",
        Status::OutOfMemory => b"Out of memory",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_frame(
        opcode: u8,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        opaque: u32,
        cas: u64,
    ) -> Vec<u8> {
        let bodylen = extras.len() + key.len() + value.len();
        let mut out = Vec::with_capacity(HEADER_LEN + bodylen);
        out.push(MAGIC_REQUEST);
        out.push(opcode);
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.push(extras.len() as u8);
        out.push(0);
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(bodylen as u32).to_be_bytes());
        out.extend_from_slice(&opaque.to_be_bytes());
        out.extend_from_slice(&cas.to_be_bytes());
        out.extend_from_slice(extras);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    #[test]
    fn test_header_roundtrip() {
        let frame = request_frame(Opcode::Set as u8, &[0; 8], b"key", b"value", 0xdeadbeef, 77);
        let header = RequestHeader::parse(frame[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.opcode, Opcode::Set as u8);
        assert_eq!(header.keylen, 3);
        assert_eq!(header.extlen, 8);
        assert_eq!(header.bodylen, 16);
        assert_eq!(header.opaque, 0xdeadbeef);
        assert_eq!(header.cas, 77);
        assert_eq!(header.value_len(), 5);
        assert!(header.is_framed());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = request_frame(Opcode::Get as u8, &[], b"k", b"", 0, 0);
        frame[0] = 0x42;
        assert!(RequestHeader::parse(frame[..HEADER_LEN].try_into().unwrap()).is_err());
    }

    #[test]
    fn test_quiet_mapping() {
        assert!(Opcode::SetQ.is_quiet());
        assert_eq!(Opcode::SetQ.base(), Opcode::Set);
        assert_eq!(Opcode::GatKQ.base(), Opcode::GatK);
        assert!(!Opcode::Get.is_quiet());
        assert!(Opcode::GetK.returns_key());
    }

    #[test]
    fn test_response_frame_layout() {
        let frame = response(
            Opcode::Get as u8,
            Status::NoError,
            0xabad1dea,
            42,
            &7u32.to_be_bytes(),
            b"",
            b"val",
        );
        assert_eq!(frame[0], MAGIC_RESPONSE);
        assert_eq!(frame[1], Opcode::Get as u8);
        // status
        assert_eq!(u16::from_be_bytes([frame[6], frame[7]]), 0);
        // bodylen = extras + value
        assert_eq!(u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]), 7);
        // opaque echoed
        assert_eq!(
            u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
            0xabad1dea
        );
        assert_eq!(&frame[HEADER_LEN..HEADER_LEN + 4], &7u32.to_be_bytes());
        assert_eq!(&frame[HEADER_LEN + 4..], b"val");
    }
}
