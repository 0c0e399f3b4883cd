//! NSP packet layouts (Module G).
//!
//! The leading `MSGFLG` byte splits as `type = bits 2..3`, `subtype = bits
//! 4..6`; for `DATA` messages bit 4 instead selects between a regular
//! segment (bits 5/6 then carry BOM/EOM) and a link-service/interrupt
//! message. Addresses, ack/nak "QUAL" subfields, and segment numbers are
//! little-endian throughout, matching every other wire format in this crate.

use crate::error::{DecodeError, EncodeError};
use crate::wire::{Reader, Writer};

pub const TYPE_DATA: u8 = 0;
pub const TYPE_ACK: u8 = 1;
pub const TYPE_CTL: u8 = 2;

pub const CTL_NOP: u8 = 0;
pub const CTL_CI: u8 = 1;
pub const CTL_CC: u8 = 2;
pub const CTL_DI: u8 = 3;
pub const CTL_DC: u8 = 4;
pub const CTL_RCI: u8 = 6;

pub const ACK_DATA: u8 = 0;
pub const ACK_OTHER: u8 = 1;
pub const ACK_CONN: u8 = 2;
pub const ACK_NORES: u8 = 3;

fn msgflg(ty: u8, subtype: u8) -> u8 {
	(ty << 2) | (subtype << 4)
}

fn split_msgflg(b: u8) -> (u8, u8) {
	((b >> 2) & 0x3, (b >> 4) & 0x7)
}

/// Split a leading `MSGFLG` byte into `(type, subtype)`, the key the NSP
/// receive dispatcher (§4.G step 1) switches on.
pub fn classify(flag: u8) -> (u8, u8) {
	split_msgflg(flag)
}

/// A 16-bit piggybacked ack/nak field: bit 15 marks it present, bits 12..13
/// classify it, bits 0..11 carry the 12-bit mod-4096 sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
	AckThis,
	NakThis,
	AckOther,
	NakOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckField {
	pub kind: AckKind,
	pub num: u16,
}

impl AckField {
	fn encode_opt(field: Option<Self>) -> u16 {
		match field {
			None => 0,
			Some(f) => {
				let qual = match f.kind {
					AckKind::AckThis => 0,
					AckKind::NakThis => 1,
					AckKind::AckOther => 2,
					AckKind::NakOther => 3,
				};
				0x8000 | (qual << 12) | (f.num & 0x0fff)
			}
		}
	}

	fn decode_opt(raw: u16) -> Option<Self> {
		if raw & 0x8000 == 0 {
			return None;
		}
		let kind = match (raw >> 12) & 0x3 {
			0 => AckKind::AckThis,
			1 => AckKind::NakThis,
			2 => AckKind::AckOther,
			_ => AckKind::NakOther,
		};
		Some(Self { kind, num: raw & 0x0fff })
	}
}

/// `ConnInit` / retransmitted `ConnInit` (CTL subtype 1 / 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInit {
	pub retransmit: bool,
	pub dstaddr: u16,
	pub srcaddr: u16,
	pub version: u8,
	pub fcopt: u8,
	pub info: u8,
	pub segsize: u16,
	pub data: Vec<u8>,
}

impl ConnInit {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_CTL, if self.retransmit { CTL_RCI } else { CTL_CI }));
		w.push_u16(self.dstaddr);
		w.push_u16(self.srcaddr);
		w.push_u8(((self.version & 0x3) << 0) | ((self.fcopt & 0x3) << 2));
		w.push_u8(self.info);
		w.push_u16(self.segsize);
		w.push_image("data", &self.data)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_CTL || (subtype != CTL_CI && subtype != CTL_RCI) {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let dstaddr = r.u16("dstaddr")?;
		let srcaddr = r.u16("srcaddr")?;
		let services = r.u8("services")?;
		let version = services & 0x3;
		let fcopt = (services >> 2) & 0x3;
		let info = r.u8("info")?;
		let segsize = r.u16("segsize")?;
		let data = r.image("data")?.to_vec();
		r.finish(false)?;
		Ok(Self { retransmit: subtype == CTL_RCI, dstaddr, srcaddr, version, fcopt, info, segsize, data })
	}
}

/// `ConnConf` (CTL subtype 2). The confirmer's own newly-assigned port is
/// placed ahead of the address it is replying to — the reverse of the field
/// order `ConnInit` uses, matching what is observed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConf {
	pub srcaddr: u16,
	pub dstaddr: u16,
	pub version: u8,
	pub fcopt: u8,
	pub info: u8,
	pub segsize: u16,
	pub data: Vec<u8>,
}

impl ConnConf {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_CTL, CTL_CC));
		w.push_u16(self.srcaddr);
		w.push_u16(self.dstaddr);
		w.push_u8((self.version & 0x3) | ((self.fcopt & 0x3) << 2));
		w.push_u8(self.info);
		w.push_u16(self.segsize);
		w.push_image("data", &self.data)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_CTL || subtype != CTL_CC {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let srcaddr = r.u16("srcaddr")?;
		let dstaddr = r.u16("dstaddr")?;
		let services = r.u8("services")?;
		let version = services & 0x3;
		let fcopt = (services >> 2) & 0x3;
		let info = r.u8("info")?;
		let segsize = r.u16("segsize")?;
		let data = r.image("data")?.to_vec();
		r.finish(false)?;
		Ok(Self { srcaddr, dstaddr, version, fcopt, info, segsize, data })
	}
}

/// `DiscInit` / `DiscConf` (CTL subtype 3 / 4). Distinguished only by which
/// constructor is called; both share the same wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
	pub confirm: bool,
	pub dstaddr: u16,
	pub srcaddr: u16,
	pub reason: u16,
	pub data: Vec<u8>,
}

impl Disconnect {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_CTL, if self.confirm { CTL_DC } else { CTL_DI }));
		w.push_u16(self.dstaddr);
		w.push_u16(self.srcaddr);
		w.push_u16(self.reason);
		w.push_image("data", &self.data)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_CTL || (subtype != CTL_DI && subtype != CTL_DC) {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let dstaddr = r.u16("dstaddr")?;
		let srcaddr = r.u16("srcaddr")?;
		let reason = r.u16("reason")?;
		let data = r.image("data")?.to_vec();
		r.finish(false)?;
		Ok(Self { confirm: subtype == CTL_DC, dstaddr, srcaddr, reason, data })
	}
}

/// `AckConn` (ACK subtype 2): acks a `ConnInit` before the application has
/// decided whether to accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckConn {
	pub dstaddr: u16,
}

impl AckConn {
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_ACK, ACK_CONN));
		w.push_u16(self.dstaddr);
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_ACK || subtype != ACK_CONN {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let dstaddr = r.u16("dstaddr")?;
		r.finish(false)?;
		Ok(Self { dstaddr })
	}
}

/// `NoRes` (ACK subtype 3): the reserved port's reply when no connection
/// identifier is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoRes {
	pub dstaddr: u16,
}

impl NoRes {
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_ACK, ACK_NORES));
		w.push_u16(self.dstaddr);
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_ACK || subtype != ACK_NORES {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let dstaddr = r.u16("dstaddr")?;
		r.finish(false)?;
		Ok(Self { dstaddr })
	}
}

/// `AckData` / `AckOther` (ACK subtype 0 / 1): carries one ack/nak field for
/// the data subchannel or the other (link-service/interrupt) subchannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
	pub other_subchannel: bool,
	pub dstaddr: u16,
	pub field: AckField,
}

impl Ack {
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_ACK, if self.other_subchannel { ACK_OTHER } else { ACK_DATA }));
		w.push_u16(self.dstaddr);
		w.push_u16(AckField::encode_opt(Some(self.field)));
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_ACK || (subtype != ACK_DATA && subtype != ACK_OTHER) {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let dstaddr = r.u16("dstaddr")?;
		let raw = r.u16("ack")?;
		let field = AckField::decode_opt(raw).ok_or(DecodeError::WrongValue { field: "ack" })?;
		r.finish(false)?;
		Ok(Self { other_subchannel: subtype == ACK_OTHER, dstaddr, field })
	}
}

/// A regular data segment, a link-service message, or an interrupt message
/// (`DATA` type, selected by bit 4 of `MSGFLG` and, for regular segments,
/// the BOM/EOM flags in bits 5/6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataKind {
	Segment { bom: bool, eom: bool },
	LinkService,
	Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSeg {
	pub kind: DataKind,
	pub dstaddr: u16,
	pub ack: Option<AckField>,
	pub segnum: u16,
	pub payload: Vec<u8>,
}

impl DataSeg {
	pub fn encode(&self) -> Vec<u8> {
		let subtype = match self.kind {
			DataKind::Segment { bom, eom } => ((bom as u8) << 1) | ((eom as u8) << 2),
			DataKind::LinkService => 1,
			DataKind::Interrupt => 3,
		};
		let mut w = Writer::new();
		w.push_u8(msgflg(TYPE_DATA, subtype));
		w.push_u16(self.dstaddr);
		w.push_u16(AckField::encode_opt(self.ack));
		w.push_u16(self.segnum & 0x0fff);
		w.push_bytes(&self.payload);
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		let flag = r.u8("msgflag")?;
		let (ty, subtype) = split_msgflg(flag);
		if ty != TYPE_DATA {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		}
		let kind = if subtype & 1 == 0 {
			DataKind::Segment { bom: subtype & 0b010 != 0, eom: subtype & 0b100 != 0 }
		} else if subtype == 1 {
			DataKind::LinkService
		} else if subtype == 3 {
			DataKind::Interrupt
		} else {
			return Err(DecodeError::WrongValue { field: "msgflag" });
		};
		let dstaddr = r.u16("dstaddr")?;
		let ack = AckField::decode_opt(r.u16("ack")?);
		let segnum = r.u16("segnum")? & 0x0fff;
		let payload = r.rest().to_vec();
		Ok(Self { kind, dstaddr, ack, segnum, payload })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conn_init_scenario_bytes() {
		let bytes = [0x18, 0x00, 0x00, 0x03, 0x00, 0x05, 0x02, 0x04, 0x02, 0x07, b'p', b'a', b'y', b'l', b'o', b'a', b'd'];
		let ci = ConnInit::decode(&bytes).unwrap();
		assert!(!ci.retransmit);
		assert_eq!(ci.dstaddr, 0);
		assert_eq!(ci.srcaddr, 3);
		assert_eq!(ci.fcopt, 1);
		assert_eq!(ci.info, 2);
		assert_eq!(ci.segsize, 516);
		assert_eq!(ci.data, b"payload");
		assert_eq!(ci.encode().unwrap(), bytes);
	}

	#[test]
	fn ack_conn_scenario_bytes() {
		let bytes = [0x24, 0x03, 0x00];
		let ack = AckConn::decode(&bytes).unwrap();
		assert_eq!(ack.dstaddr, 3);
		assert_eq!(ack.encode(), bytes);
	}

	#[test]
	fn conn_conf_scenario_bytes() {
		let bytes = [0x28, 0x0b, 0x00, 0x03, 0x00, 0x05, 0x02, 0x04, 0x02, 0x07, b'p', b'a', b'y', b'l', b'o', b'a', b'd'];
		let cc = ConnConf::decode(&bytes).unwrap();
		assert_eq!(cc.srcaddr, 11);
		assert_eq!(cc.dstaddr, 3);
		assert_eq!(cc.fcopt, 1);
		assert_eq!(cc.info, 2);
		assert_eq!(cc.segsize, 516);
		assert_eq!(cc.encode().unwrap(), bytes);
	}

	#[test]
	fn data_segment_roundtrip_with_bom_eom() {
		let seg = DataSeg { kind: DataKind::Segment { bom: true, eom: false }, dstaddr: 11, ack: None, segnum: 1, payload: vec![b'A'; 516] };
		let bytes = seg.encode();
		assert_eq!(DataSeg::decode(&bytes).unwrap(), seg);

		let last = DataSeg { kind: DataKind::Segment { bom: false, eom: true }, dstaddr: 11, ack: None, segnum: 2, payload: vec![b'A'; 84] };
		let bytes = last.encode();
		assert_eq!(DataSeg::decode(&bytes).unwrap(), last);
	}

	#[test]
	fn data_segment_with_piggybacked_ack() {
		let seg = DataSeg {
			kind: DataKind::Segment { bom: true, eom: true },
			dstaddr: 11,
			ack: Some(AckField { kind: AckKind::AckThis, num: 4095 }),
			segnum: 4095,
			payload: vec![1, 2, 3],
		};
		let bytes = seg.encode();
		assert_eq!(DataSeg::decode(&bytes).unwrap(), seg);
	}

	#[test]
	fn disconnect_roundtrip() {
		let di = Disconnect { confirm: false, dstaddr: 11, srcaddr: 3, reason: 0, data: Vec::new() };
		let bytes = di.encode().unwrap();
		assert_eq!(Disconnect::decode(&bytes).unwrap(), di);

		let dc = Disconnect { confirm: true, dstaddr: 11, srcaddr: 3, reason: 42, data: Vec::new() };
		let bytes = dc.encode().unwrap();
		let decoded = Disconnect::decode(&bytes).unwrap();
		assert!(decoded.confirm);
		assert_eq!(decoded.reason, 42);
	}

	#[test]
	fn no_res_roundtrip() {
		let nr = NoRes { dstaddr: 3 };
		assert_eq!(NoRes::decode(&nr.encode()).unwrap(), nr);
	}
}
