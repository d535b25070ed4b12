// DBFT sub-messages carried in `ConsensusPayload::data`.
//
// Every message starts with the two-byte inner header
// `{ message_type: u8, view_number: u8 }` so it can be routed before the
// body is verified. Type bytes 0x00..=0x0F belong to DBFT.

use themis_core::{Address, CodecError, CodecResult, Decode, Encode, Sink, Source, Transaction};
use themis_crypto::Signature;

pub const CHANGE_VIEW: u8 = 0x00;
pub const PREPARE_REQUEST: u8 = 0x01;
pub const PREPARE_RESPONSE: u8 = 0x02;
pub const BLOCK_SIGNATURES: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbftBody {
    ChangeView {
        new_view: u8,
    },
    PrepareRequest {
        nonce: u64,
        next_bookkeeper: Address,
        transactions: Vec<Transaction>,
        signature: Signature,
    },
    PrepareResponse {
        signature: Signature,
    },
    /// Finalizing signatures as `(bookkeeper index, signature)` pairs.
    BlockSignatures {
        signatures: Vec<(u16, Signature)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbftMessage {
    pub view: u8,
    pub body: DbftBody,
}

impl DbftMessage {
    pub fn new(view: u8, body: DbftBody) -> Self {
        DbftMessage { view, body }
    }

    pub fn message_type(&self) -> u8 {
        match self.body {
            DbftBody::ChangeView { .. } => CHANGE_VIEW,
            DbftBody::PrepareRequest { .. } => PREPARE_REQUEST,
            DbftBody::PrepareResponse { .. } => PREPARE_RESPONSE,
            DbftBody::BlockSignatures { .. } => BLOCK_SIGNATURES,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.body {
            DbftBody::ChangeView { .. } => "ChangeView",
            DbftBody::PrepareRequest { .. } => "PrepareRequest",
            DbftBody::PrepareResponse { .. } => "PrepareResponse",
            DbftBody::BlockSignatures { .. } => "BlockSignatures",
        }
    }
}

impl Encode for DbftMessage {
    fn encode(&self, sink: &mut Sink) {
        sink.write_u8(self.message_type());
        sink.write_u8(self.view);
        match &self.body {
            DbftBody::ChangeView { new_view } => sink.write_u8(*new_view),
            DbftBody::PrepareRequest {
                nonce,
                next_bookkeeper,
                transactions,
                signature,
            } => {
                sink.write_u64(*nonce);
                next_bookkeeper.encode(sink);
                transactions.encode(sink);
                sink.write_signature(signature);
            }
            DbftBody::PrepareResponse { signature } => sink.write_signature(signature),
            DbftBody::BlockSignatures { signatures } => {
                sink.write_var_uint(signatures.len() as u64);
                for (index, sig) in signatures {
                    sink.write_u16(*index);
                    sink.write_signature(sig);
                }
            }
        }
    }
}

impl Decode for DbftMessage {
    fn decode(source: &mut Source<'_>) -> CodecResult<Self> {
        let message_type = source.read_u8()?;
        let view = source.read_u8()?;
        let body = match message_type {
            CHANGE_VIEW => DbftBody::ChangeView {
                new_view: source.read_u8()?,
            },
            PREPARE_REQUEST => DbftBody::PrepareRequest {
                nonce: source.read_u64()?,
                next_bookkeeper: Address::decode(source)?,
                transactions: Vec::<Transaction>::decode(source)?,
                signature: source.read_signature()?,
            },
            PREPARE_RESPONSE => DbftBody::PrepareResponse {
                signature: source.read_signature()?,
            },
            BLOCK_SIGNATURES => {
                let count = source.read_count(2 + 64)?;
                let mut signatures = Vec::with_capacity(count);
                for _ in 0..count {
                    signatures.push((source.read_u16()?, source.read_signature()?));
                }
                DbftBody::BlockSignatures { signatures }
            }
            other => {
                return Err(CodecError::Irregular(format!(
                    "unknown DBFT message type {:#04x}",
                    other
                )))
            }
        };
        Ok(DbftMessage { view, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_header_layout() {
        let msg = DbftMessage::new(3, DbftBody::ChangeView { new_view: 4 });
        assert_eq!(msg.to_bytes(), vec![CHANGE_VIEW, 3, 4]);
    }

    #[test]
    fn test_unknown_type_is_irregular() {
        assert!(matches!(
            DbftMessage::from_bytes(&[0x07, 0, 0]),
            Err(CodecError::Irregular(_))
        ));
        // VBFT type bytes are not DBFT messages either
        assert!(matches!(
            DbftMessage::from_bytes(&[0x10, 0, 0]),
            Err(CodecError::Irregular(_))
        ));
    }

    #[test]
    fn test_block_signatures_decode() {
        let msg = DbftMessage::new(
            0,
            DbftBody::BlockSignatures {
                signatures: vec![(0, Signature([1u8; 64])), (2, Signature([2u8; 64]))],
            },
        );
        let bytes = msg.to_bytes();
        assert_eq!(DbftMessage::from_bytes(&bytes).unwrap(), msg);
        assert_eq!(
            DbftMessage::from_bytes(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated)
        );
    }
}
