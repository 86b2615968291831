//! Inter-node wire protocol (spec.md §6, "Wire messages").
//!
//! All integers are big-endian; `slice` is `u32 len ‖ bytes`; an attribute
//! vector is `u16 count ‖ slice * count`. One leading tag byte selects the
//! variant, matching the on-disk record classes' own leading-discriminator
//! convention (`codec::key`).

use crate::error::{EngineError, EngineResult};
use crate::ids::{RegionId, TransferId, Version};

const TAG_CHAIN_OP: u8 = 1;
const TAG_CHAIN_SUBSPACE: u8 = 2;
const TAG_CHAIN_ACK: u8 = 3;
const TAG_XFER_HS: u8 = 4;
const TAG_XFER_HSA: u8 = 5;
const TAG_XFER_HA: u8 = 6;
const TAG_XFER_HW: u8 = 7;
const TAG_XFER_OP: u8 = 8;
const TAG_XFER_ACK: u8 = 9;
const TAG_REQ_ATOMIC: u8 = 10;
const TAG_RESP_ATOMIC: u8 = 11;

const FLAG_FRESH: u8 = 0x01;
const FLAG_HAS_VALUE: u8 = 0x02;
const FLAG_WIPE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ChainOp {
        is_fresh: bool,
        has_value: bool,
        prev_version: Version,
        this_version: Version,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
    },
    ChainSubspace {
        prev_version: Version,
        this_version: Version,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
        prev_region: RegionId,
        this_old_region: RegionId,
        this_new_region: RegionId,
        next_region: RegionId,
    },
    ChainAck {
        this_version: Version,
        key: Vec<u8>,
    },
    XferHs {
        transfer_id: TransferId,
    },
    XferHsa {
        transfer_id: TransferId,
        timestamp: Vec<u8>,
    },
    XferHa {
        transfer_id: TransferId,
        wipe: bool,
    },
    XferHw {
        transfer_id: TransferId,
    },
    XferOp {
        has_value: bool,
        transfer_id: TransferId,
        region_id: RegionId,
        seq_no: u64,
        version: Version,
        key: Vec<u8>,
        value: Vec<Vec<u8>>,
    },
    XferAck {
        transfer_id: TransferId,
        seq_no: u64,
    },
    ReqAtomic(Vec<u8>),
    RespAtomic(Vec<u8>),
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::ChainOp {
                is_fresh,
                has_value,
                prev_version,
                this_version,
                key,
                value,
            } => {
                out.push(TAG_CHAIN_OP);
                let mut flags = 0u8;
                if *is_fresh {
                    flags |= FLAG_FRESH;
                }
                if *has_value {
                    flags |= FLAG_HAS_VALUE;
                }
                out.push(flags);
                out.extend_from_slice(&prev_version.to_be_bytes());
                out.extend_from_slice(&this_version.to_be_bytes());
                write_slice(&mut out, key);
                write_value(&mut out, value);
            }
            Message::ChainSubspace {
                prev_version,
                this_version,
                key,
                value,
                prev_region,
                this_old_region,
                this_new_region,
                next_region,
            } => {
                out.push(TAG_CHAIN_SUBSPACE);
                out.extend_from_slice(&prev_version.to_be_bytes());
                out.extend_from_slice(&this_version.to_be_bytes());
                write_slice(&mut out, key);
                write_value(&mut out, value);
                out.extend_from_slice(&prev_region.get().to_be_bytes());
                out.extend_from_slice(&this_old_region.get().to_be_bytes());
                out.extend_from_slice(&this_new_region.get().to_be_bytes());
                out.extend_from_slice(&next_region.get().to_be_bytes());
            }
            Message::ChainAck { this_version, key } => {
                out.push(TAG_CHAIN_ACK);
                out.extend_from_slice(&this_version.to_be_bytes());
                write_slice(&mut out, key);
            }
            Message::XferHs { transfer_id } => {
                out.push(TAG_XFER_HS);
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
            }
            Message::XferHsa { transfer_id, timestamp } => {
                out.push(TAG_XFER_HSA);
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
                write_slice(&mut out, timestamp);
            }
            Message::XferHa { transfer_id, wipe } => {
                out.push(TAG_XFER_HA);
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
                out.push(if *wipe { FLAG_WIPE } else { 0 });
            }
            Message::XferHw { transfer_id } => {
                out.push(TAG_XFER_HW);
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
            }
            Message::XferOp {
                has_value,
                transfer_id,
                region_id,
                seq_no,
                version,
                key,
                value,
            } => {
                out.push(TAG_XFER_OP);
                out.push(if *has_value { FLAG_HAS_VALUE } else { 0 });
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
                out.extend_from_slice(&region_id.get().to_be_bytes());
                out.extend_from_slice(&seq_no.to_be_bytes());
                out.extend_from_slice(&version.to_be_bytes());
                write_slice(&mut out, key);
                write_value(&mut out, value);
            }
            Message::XferAck { transfer_id, seq_no } => {
                out.push(TAG_XFER_ACK);
                out.extend_from_slice(&transfer_id.get().to_be_bytes());
                out.extend_from_slice(&seq_no.to_be_bytes());
            }
            Message::ReqAtomic(bytes) => {
                out.push(TAG_REQ_ATOMIC);
                write_slice(&mut out, bytes);
            }
            Message::RespAtomic(bytes) => {
                out.push(TAG_RESP_ATOMIC);
                write_slice(&mut out, bytes);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> EngineResult<Message> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let msg = match tag {
            TAG_CHAIN_OP => {
                let flags = r.u8()?;
                Message::ChainOp {
                    is_fresh: flags & FLAG_FRESH != 0,
                    has_value: flags & FLAG_HAS_VALUE != 0,
                    prev_version: r.u64()?,
                    this_version: r.u64()?,
                    key: r.slice()?,
                    value: r.value()?,
                }
            }
            TAG_CHAIN_SUBSPACE => Message::ChainSubspace {
                prev_version: r.u64()?,
                this_version: r.u64()?,
                key: r.slice()?,
                value: r.value()?,
                prev_region: RegionId::new(r.u64()?),
                this_old_region: RegionId::new(r.u64()?),
                this_new_region: RegionId::new(r.u64()?),
                next_region: RegionId::new(r.u64()?),
            },
            TAG_CHAIN_ACK => Message::ChainAck {
                this_version: r.u64()?,
                key: r.slice()?,
            },
            TAG_XFER_HS => Message::XferHs {
                transfer_id: TransferId::new(r.u64()?),
            },
            TAG_XFER_HSA => Message::XferHsa {
                transfer_id: TransferId::new(r.u64()?),
                timestamp: r.slice()?,
            },
            TAG_XFER_HA => Message::XferHa {
                transfer_id: TransferId::new(r.u64()?),
                wipe: r.u8()? & FLAG_WIPE != 0,
            },
            TAG_XFER_HW => Message::XferHw {
                transfer_id: TransferId::new(r.u64()?),
            },
            TAG_XFER_OP => {
                let flags = r.u8()?;
                Message::XferOp {
                    has_value: flags & FLAG_HAS_VALUE != 0,
                    transfer_id: TransferId::new(r.u64()?),
                    region_id: RegionId::new(r.u64()?),
                    seq_no: r.u64()?,
                    version: r.u64()?,
                    key: r.slice()?,
                    value: r.value()?,
                }
            }
            TAG_XFER_ACK => Message::XferAck {
                transfer_id: TransferId::new(r.u64()?),
                seq_no: r.u64()?,
            },
            TAG_REQ_ATOMIC => Message::ReqAtomic(r.slice()?),
            TAG_RESP_ATOMIC => Message::RespAtomic(r.slice()?),
            other => return Err(EngineError::BadEncoding {
                region: 0,
                key_hex: String::new(),
                reason: format!("unknown wire tag {other}"),
            }),
        };
        Ok(msg)
    }
}

fn write_slice(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn write_value(out: &mut Vec<u8>, value: &[Vec<u8>]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    for attr in value {
        write_slice(out, attr);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| truncated())?;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> EngineResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> EngineResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> EngineResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u16(&mut self) -> EngineResult<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn slice(&mut self) -> EngineResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn value(&mut self) -> EngineResult<Vec<Vec<u8>>> {
        let count = self.u16()?;
        (0..count).map(|_| self.slice()).collect()
    }
}

fn truncated() -> EngineError {
    EngineError::BadEncoding {
        region: 0,
        key_hex: String::new(),
        reason: "truncated wire message".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_op_round_trips() {
        let msg = Message::ChainOp {
            is_fresh: true,
            has_value: true,
            prev_version: 0,
            this_version: 1,
            key: b"k".to_vec(),
            value: vec![b"a".to_vec(), b"bb".to_vec()],
        };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn xfer_op_round_trips() {
        let msg = Message::XferOp {
            has_value: false,
            transfer_id: TransferId::new(9),
            region_id: RegionId::new(3),
            seq_no: 42,
            version: 7,
            key: b"key".to_vec(),
            value: vec![],
        };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_truncated_input() {
        let msg = Message::ChainAck {
            this_version: 1,
            key: b"k".to_vec(),
        };
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Message::decode(&bytes).is_err());
    }
}
