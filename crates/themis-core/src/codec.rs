// Ledger codec: fixed little-endian integers, canonical var-uint lengths.
//
// SAFETY INVARIANTS:
// 1. Every value has exactly one encoding; non-minimal var-uints are
//    rejected as Irregular so hashes over encodings are stable
// 2. Decoding never reads past the input; short input is Truncated
// 3. `Decode::from_bytes` requires the whole input to be consumed
//
// var-uint layout:
//   v < 0xFD              -> 1 byte
//   v <= 0xFFFF           -> 0xFD, u16 LE
//   v <= 0xFFFF_FFFF      -> 0xFE, u32 LE
//   otherwise             -> 0xFF, u64 LE

use themis_crypto::{Hash256, PublicKey, Signature, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use thiserror::Error;

/// Upper bound for any single var-bytes field (guards allocation on hostile input).
pub const MAX_VAR_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unexpected end of input")]
    Truncated,

    #[error("irregular encoding: {0}")]
    Irregular(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Append-only byte writer.
#[derive(Debug, Default, Clone)]
pub struct Sink {
    buf: Vec<u8>,
}

impl Sink {
    pub fn new() -> Self {
        Sink { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Sink {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_var_uint(&mut self, v: u64) {
        if v < 0xFD {
            self.write_u8(v as u8);
        } else if v <= 0xFFFF {
            self.write_u8(0xFD);
            self.write_u16(v as u16);
        } else if v <= 0xFFFF_FFFF {
            self.write_u8(0xFE);
            self.write_u32(v as u32);
        } else {
            self.write_u8(0xFF);
            self.write_u64(v);
        }
    }

    /// Raw bytes, no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    pub fn write_hash(&mut self, h: &Hash256) {
        self.write_bytes(h.as_bytes());
    }

    pub fn write_public_key(&mut self, pk: &PublicKey) {
        self.write_bytes(pk.as_bytes());
    }

    pub fn write_signature(&mut self, sig: &Signature) {
        self.write_bytes(sig.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Zero-copy byte reader.
#[derive(Debug, Clone)]
pub struct Source<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Source<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Source { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Irregular(format!("bool byte {:#04x}", other))),
        }
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_var_uint(&mut self) -> CodecResult<u64> {
        let tag = self.read_u8()?;
        let (value, min) = match tag {
            0xFD => (u64::from(self.read_u16()?), 0xFD),
            0xFE => (u64::from(self.read_u32()?), 0x1_0000),
            0xFF => (self.read_u64()?, 0x1_0000_0000),
            small => return Ok(u64::from(small)),
        };
        if value < min {
            return Err(CodecError::Irregular(format!(
                "non-minimal var-uint {} under tag {:#04x}",
                value, tag
            )));
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_var_uint()?;
        if len > MAX_VAR_BYTES {
            return Err(CodecError::Irregular(format!("var-bytes length {} too large", len)));
        }
        self.read_bytes(len as usize)
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Irregular("invalid utf-8".into()))
    }

    pub fn read_hash(&mut self) -> CodecResult<Hash256> {
        Ok(Hash256(self.read_array()?))
    }

    pub fn read_public_key(&mut self) -> CodecResult<PublicKey> {
        let raw = self.read_bytes(PUBLIC_KEY_LENGTH)?;
        PublicKey::from_bytes(raw).map_err(|e| CodecError::Irregular(e.to_string()))
    }

    pub fn read_signature(&mut self) -> CodecResult<Signature> {
        let raw = self.read_bytes(SIGNATURE_LENGTH)?;
        Signature::from_slice(raw).map_err(|e| CodecError::Irregular(e.to_string()))
    }

    /// Read a var-uint element count, rejecting counts the remaining input cannot hold.
    pub fn read_count(&mut self, min_item_size: usize) -> CodecResult<usize> {
        let count = self.read_var_uint()?;
        let needed = count.saturating_mul(min_item_size.max(1) as u64);
        if needed > self.remaining() as u64 {
            return Err(CodecError::Truncated);
        }
        Ok(count as usize)
    }
}

/// Types with a canonical ledger encoding.
pub trait Encode {
    fn encode(&self, sink: &mut Sink);

    fn to_bytes(&self) -> Vec<u8> {
        let mut sink = Sink::new();
        self.encode(&mut sink);
        sink.into_bytes()
    }
}

pub trait Decode: Sized {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self>;

    /// Decode a complete value; trailing bytes are irregular.
    fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        let mut source = Source::new(bytes);
        let value = Self::decode(&mut source)?;
        if !source.is_empty() {
            return Err(CodecError::Irregular(format!(
                "{} trailing bytes",
                source.remaining()
            )));
        }
        Ok(value)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, sink: &mut Sink) {
        sink.write_var_uint(self.len() as u64);
        for item in self {
            item.encode(sink);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let count = source.read_count(1)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(T::decode(source)?);
        }
        Ok(out)
    }
}

impl Encode for PublicKey {
    fn encode(&self, sink: &mut Sink) {
        sink.write_public_key(self);
    }
}

impl Decode for PublicKey {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        source.read_public_key()
    }
}

impl Encode for Signature {
    fn encode(&self, sink: &mut Sink) {
        sink.write_signature(self);
    }
}

impl Decode for Signature {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        source.read_signature()
    }
}
