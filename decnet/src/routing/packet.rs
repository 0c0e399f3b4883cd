//! Point-to-point routing-init packets (Module F, §4.F, §6 "Routing-init
//! packet set"). Field layouts below are reverse-read from the literal byte
//! scenario in §8 scenario 2 and from the Phase II `NodeInit`/`NodeVerify`
//! shapes (msgflag 0x58, disambiguated by `starttype`) — there is no running
//! reference implementation to diff against, so the bit-exact split of the
//! info byte (verif/blo/ntype) is validated only against that one scenario.
//! The sub-byte bit-map groups themselves are `bilge` bitfield structs rather
//! than hand-rolled shifting, matching how the rest of the retrieval pack
//! packs flag bytes (`net/src/ip/v4.rs`, `net/src/dns/mod.rs`).

use bilge::prelude::*;

use crate::common::{NodeId, Version};
use crate::error::{DecodeError, EncodeError};
use crate::wire::{Reader, Writer};

/// `PtpInit`/`PtpInit3`'s info byte: verification request, blocking flag, and
/// 2-bit node type, packed LSB-first (§3 "bit-map group").
#[bitsize(8)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
struct PtpInitInfo {
	verif: bool,
	blo: bool,
	ntype: u2,
	reserved: u4,
}

/// Phase-II `NodeInit`'s `int` byte: router priority in the low 3 bits.
#[bitsize(8)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
struct NodeInitIntByte {
	int: u3,
	reserved: u5,
}

/// Phase-II `NodeInit`'s `verif` byte: verification flag plus the 2-bit
/// `rint` (requires-verification) field.
#[bitsize(8)]
#[derive(FromBits, Clone, Copy, PartialEq, Eq, Debug)]
struct NodeInitVerifByte {
	verif: bool,
	rint: u2,
	reserved: u5,
}

pub const MSGFLAG_PTP_INIT: u8 = 0x01;
pub const MSGFLAG_PTP_VERIFY: u8 = 0x03;
pub const MSGFLAG_PTP_HELLO: u8 = 0x05;
pub const MSGFLAG_PHASE2: u8 = 0x58;

pub const PHASE2_STARTTYPE_INIT: u8 = 1;
pub const PHASE2_STARTTYPE_VERIFY: u8 = 2;

/// Routing node type, carried in the low 2 bits (after a 2-bit shift) of the
/// `PtpInit`/`PtpInit3` info byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
	L2Router,
	L1Router,
	Endnode,
	Unknown(u32),
}

impl NodeType {
	fn from_bits(v: u32) -> Self {
		match v {
			0 => Self::L2Router,
			1 => Self::L1Router,
			2 => Self::Endnode,
			other => Self::Unknown(other),
		}
	}

	fn bits(self) -> u32 {
		match self {
			Self::L2Router => 0,
			Self::L1Router => 1,
			Self::Endnode => 2,
			Self::Unknown(v) => v,
		}
	}
}

/// Phase III/IV point-to-point init message. `phase3` selects whether this
/// is encoded/decoded as `PtpInit3` (0x01, same shape, narrower validity) or
/// `PtpInit` — the two share a wire layout in this implementation, matching
/// how `route_ptp.py` builds them from the same fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpInit {
	pub srcnode: NodeId,
	pub verif: bool,
	pub blo: bool,
	pub ntype: NodeType,
	pub blksize: u16,
	pub tiver: Version,
	pub timer: u16,
	pub data: Vec<u8>,
}

impl PtpInit {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(MSGFLAG_PTP_INIT);
		w.push_u16(self.srcnode.raw());

		let info: u8 = PtpInitInfo::new(self.verif, self.blo, u2::new(self.ntype.bits() as u8), u4::new(0)).into();
		w.push_u8(info);

		w.push_u16(self.blksize);
		w.push_u8(self.tiver.0);
		w.push_u8(self.tiver.1);
		w.push_u8(self.tiver.2);
		w.push_u16(self.timer);
		w.push_image("data", &self.data)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		r.expect_u8("msgflag", MSGFLAG_PTP_INIT)?;
		let srcnode_raw = r.u16("srcnode")?;
		let srcnode = NodeId::from_raw(srcnode_raw, false).ok_or(DecodeError::WrongValue { field: "srcnode" })?;

		let info = PtpInitInfo::from(r.u8("info")?);
		let verif = info.verif();
		let blo = info.blo();
		let ntype = NodeType::from_bits(info.ntype().value() as u32);

		let blksize = r.u16("blksize")?;
		let tiver = Version(r.u8("tiver.0")?, r.u8("tiver.1")?, r.u8("tiver.2")?);
		let timer = r.u16("timer")?;
		let data = r.image("data")?.to_vec();
		r.finish(false)?;

		Ok(Self { srcnode, verif, blo, ntype, blksize, tiver, timer, data })
	}
}

/// `PtpVerify` (§6: start byte `0x03`): verification-function challenge/reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpVerify {
	pub srcnode: NodeId,
	pub fcnval: Vec<u8>,
}

impl PtpVerify {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(MSGFLAG_PTP_VERIFY);
		w.push_u16(self.srcnode.raw());
		w.push_image("fcnval", &self.fcnval)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		r.expect_u8("msgflag", MSGFLAG_PTP_VERIFY)?;
		let srcnode_raw = r.u16("srcnode")?;
		let srcnode = NodeId::from_raw(srcnode_raw, false).ok_or(DecodeError::WrongValue { field: "srcnode" })?;
		let fcnval = r.image("fcnval")?.to_vec();
		r.finish(false)?;
		Ok(Self { srcnode, fcnval })
	}
}

/// `PtpHello` (§6: start byte `0x05`): periodic keepalive whose `testdata`
/// must be all `0xAA` bytes — that content check is the caller's job, not
/// the codec's, since it's a protocol rule rather than a layout constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpHello {
	pub srcnode: NodeId,
	pub testdata: Vec<u8>,
}

impl PtpHello {
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(MSGFLAG_PTP_HELLO);
		w.push_u16(self.srcnode.raw());
		w.push_bytes(&self.testdata);
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		r.expect_u8("msgflag", MSGFLAG_PTP_HELLO)?;
		let srcnode_raw = r.u16("srcnode")?;
		let srcnode = NodeId::from_raw(srcnode_raw, false).ok_or(DecodeError::WrongValue { field: "srcnode" })?;
		let testdata = r.rest().to_vec();
		Ok(Self { srcnode, testdata })
	}

	/// The content rule §6 describes for `PtpHello.testdata`.
	pub fn testdata_valid(&self) -> bool {
		!self.testdata.is_empty() && self.testdata.iter().all(|&b| b == 0xaa)
	}
}

/// Phase II `NodeInit` (§6: msgflag `0x58`, `starttype` 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInit {
	pub srcnode: u16,
	pub nodename: Vec<u8>,
	pub int: u32,
	pub verif: bool,
	pub rint: u32,
	pub blksize: u16,
	pub nspsize: u16,
	pub maxlnks: u16,
	pub routver: Version,
	pub commver: Version,
	pub sysver: Vec<u8>,
}

impl NodeInit {
	pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
		let mut w = Writer::new();
		w.push_u8(MSGFLAG_PHASE2);
		w.push_u8(PHASE2_STARTTYPE_INIT);
		w.push_extensible(self.srcnode as u64);
		w.push_image("nodename", &self.nodename)?;

		let int_byte: u8 = NodeInitIntByte::new(u3::new(self.int as u8), u5::new(0)).into();
		w.push_u8(int_byte);

		let verif_byte: u8 = NodeInitVerifByte::new(self.verif, u2::new(self.rint as u8), u5::new(0)).into();
		w.push_u8(verif_byte);

		w.push_u16(self.blksize);
		w.push_u16(self.nspsize);
		w.push_u16(self.maxlnks);
		w.push_u8(self.routver.0);
		w.push_u8(self.routver.1);
		w.push_u8(self.routver.2);
		w.push_u8(self.commver.0);
		w.push_u8(self.commver.1);
		w.push_u8(self.commver.2);
		w.push_image("sysver", &self.sysver)?;
		Ok(w.into_bytes())
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		r.expect_u8("msgflag", MSGFLAG_PHASE2)?;
		r.expect_u8("starttype", PHASE2_STARTTYPE_INIT)?;
		let srcnode = r.extensible("srcnode", 2)? as u16;
		let nodename = r.image("nodename")?.to_vec();

		let int_byte = NodeInitIntByte::from(r.u8("int")?);
		let int = int_byte.int().value() as u32;

		let verif_byte = NodeInitVerifByte::from(r.u8("verif")?);
		let verif = verif_byte.verif();
		let rint = verif_byte.rint().value() as u32;

		let blksize = r.u16("blksize")?;
		let nspsize = r.u16("nspsize")?;
		let maxlnks = r.u16("maxlnks")?;
		let routver = Version(r.u8("routver.0")?, r.u8("routver.1")?, r.u8("routver.2")?);
		let commver = Version(r.u8("commver.0")?, r.u8("commver.1")?, r.u8("commver.2")?);
		let sysver = r.image("sysver")?.to_vec();
		r.finish(false)?;

		Ok(Self { srcnode, nodename, int, verif, rint, blksize, nspsize, maxlnks, routver, commver, sysver })
	}
}

/// Phase II `NodeVerify` (§6: msgflag `0x58`, `starttype` 2 — stored in a
/// 2-byte field even though `NodeInit`'s is 1 byte).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVerify {
	pub password: [u8; 8],
}

impl NodeVerify {
	pub fn encode(&self) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(MSGFLAG_PHASE2);
		w.push_u16(PHASE2_STARTTYPE_VERIFY as u16);
		w.push_fixed(&self.password, 8);
		w.into_bytes()
	}

	pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
		let mut r = Reader::new(buf);
		r.expect_u8("msgflag", MSGFLAG_PHASE2)?;
		let starttype = r.u16("starttype")?;
		if starttype != PHASE2_STARTTYPE_VERIFY as u16 {
			return Err(DecodeError::WrongValue { field: "starttype" });
		}
		let bytes = r.fixed("password", 8)?;
		r.finish(false)?;
		let mut password = [0u8; 8];
		password.copy_from_slice(bytes);
		Ok(Self { password })
	}
}

/// Flags-byte format selector for routing data packets. Only the bit this
/// crate needs to strip the datalink-dependent header is interpreted; the
/// RQR/RTS/IE control bits and hop-by-hop forwarding fields are the routing
/// decision module's concern and are out of scope on a two-node
/// point-to-point adjacency (§1 non-goals).
pub const DATA_FLAG_LONG_FORMAT: u8 = 0x04;

/// A routing data packet stripped down to its destination, source, and
/// NSP-bound payload. Long-format packets carry padded 8-byte addresses and
/// a service-class/PT byte ahead of the same payload; since forwarding never
/// happens on a point-to-point adjacency, those extra bytes are skipped
/// rather than interpreted field-by-field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingData {
	pub dst: NodeId,
	pub src: NodeId,
	pub visits: u8,
}

impl RoutingData {
	/// Strip the short-format header and return `(header, payload)`. Long
	/// format is recognised (and rejected) but not decoded: it only matters
	/// for multi-hop forwarding, which this implementation never performs.
	pub fn strip(buf: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
		let mut r = Reader::new(buf);
		let flags = r.u8("flags")?;

		if flags & DATA_FLAG_LONG_FORMAT != 0 {
			return Err(DecodeError::WrongValue { field: "flags" });
		}

		let dst = NodeId::from_raw(r.u16("dst")?, false).ok_or(DecodeError::WrongValue { field: "dst" })?;
		let src = NodeId::from_raw(r.u16("src")?, false).ok_or(DecodeError::WrongValue { field: "src" })?;
		let visits = r.u8("visits")?;
		Ok((Self { dst, src, visits }, r.remaining_slice()))
	}

	pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
		let mut w = Writer::new();
		w.push_u8(0); // short format, no RQR/RTS/IE
		w.push_u16(self.dst.raw());
		w.push_u16(self.src.raw());
		w.push_u8(self.visits);
		w.push_bytes(payload);
		w.into_bytes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ptp_init_scenario_bytes() {
		let bytes = [0x01, 0x02, 0x04, 0x02, 0x10, 0x02, 0x02, 0x00, 0x00, 0x0a, 0x00, 0x00];
		let init = PtpInit::decode(&bytes).unwrap();
		assert_eq!(init.srcnode, NodeId::new(1, 2).unwrap());
		assert_eq!(init.ntype, NodeType::L2Router);
		assert_eq!(init.blksize, 528);
		assert_eq!(init.tiver, Version(2, 0, 0));
		assert_eq!(init.timer, 10);
		assert!(init.data.is_empty());
		assert_eq!(init.encode().unwrap(), bytes);
	}

	#[test]
	fn ptp_hello_testdata_validation() {
		let good = PtpHello { srcnode: NodeId::new(1, 2).unwrap(), testdata: vec![0xaa; 4] };
		assert!(good.testdata_valid());

		let bad = PtpHello { srcnode: NodeId::new(1, 2).unwrap(), testdata: vec![0xaa, 0x00] };
		assert!(!bad.testdata_valid());
	}

	#[test]
	fn node_verify_roundtrip() {
		let nv = NodeVerify { password: *b"PASSWORD" };
		let bytes = nv.encode();
		assert_eq!(NodeVerify::decode(&bytes).unwrap(), nv);
	}

	#[test]
	fn node_init_roundtrip() {
		let ni = NodeInit {
			srcnode: 42,
			nodename: b"FOOBAR".to_vec(),
			int: 3,
			verif: true,
			rint: 1,
			blksize: 576,
			nspsize: 576,
			maxlnks: 32,
			routver: Version(3, 2, 0),
			commver: Version(3, 2, 0),
			sysver: b"v1".to_vec(),
		};
		let bytes = ni.encode().unwrap();
		assert_eq!(NodeInit::decode(&bytes).unwrap(), ni);
	}

	#[test]
	fn ptp_verify_roundtrip() {
		let pv = PtpVerify { srcnode: NodeId::new(1, 2).unwrap(), fcnval: b"IVERIF".to_vec() };
		let bytes = pv.encode().unwrap();
		assert_eq!(bytes[3], 6);
		assert_eq!(&bytes[4..], b"IVERIF");
		assert_eq!(PtpVerify::decode(&bytes).unwrap(), pv);
	}

	#[test]
	fn routing_data_short_format_roundtrip() {
		let hdr = RoutingData { dst: NodeId::new(1, 2).unwrap(), src: NodeId::new(1, 3).unwrap(), visits: 0 };
		let bytes = hdr.wrap(b"nsp payload");
		let (decoded, payload) = RoutingData::strip(&bytes).unwrap();
		assert_eq!(decoded, hdr);
		assert_eq!(payload, b"nsp payload");
	}

	#[test]
	fn routing_data_long_format_rejected() {
		let bytes = [DATA_FLAG_LONG_FORMAT, 0, 0, 0, 0];
		assert_eq!(RoutingData::strip(&bytes), Err(DecodeError::WrongValue { field: "flags" }));
	}
}
