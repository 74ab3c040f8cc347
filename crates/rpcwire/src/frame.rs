//! # Protocol Frames
//!
//! Defines the RPC envelope: a `Call` carrying the common input header plus
//! the encoded input record, and a `Reply` carrying the common output
//! header plus the encoded output record.
//!
//! Both are tagged unions whose payload is a record of header fields. The
//! argument and result records are spliced in verbatim as the `args` and
//! `out` fields, so this layer never needs their schemas.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown header fields are safely skipped and
//!   absent optional ones take their default.
//! - **Echo**: a reply carries the `seq` of the call it answers.

use crate::errno::TeErrno;
use crate::error::Error;
use crate::error::Result;
use crate::flag::LibFlags;
use crate::mode::CallMode;

use rpcpack::Decoder;
use rpcpack::Encoder;
use rpcpack::Pack;
use rpcpack::Unpack;

/// The common input header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallHeader<'a> {
    pub func: &'a str,
    pub mode: CallMode,
    pub sid: u32,
    pub seq: u16,
    /// Scheduled start, ms since the epoch. Zero means now.
    pub start_ms: u64,
    pub lib: LibFlags,
    /// Advisory: the server may skip its own logging.
    pub silent: bool,
    /// The deferred job a `Complete` call waits for, zero otherwise.
    pub jobid: u64,
}

/// Encodes an outbound Call frame.
pub struct CallEncoder<'a> {
    pub header: &'a CallHeader<'a>,
    pub args: &'a [u8],
}

impl<'a> CallEncoder<'a> {
    pub fn new(header: &'a CallHeader<'a>, args: &'a [u8]) -> Self {
        Self { header, args }
    }

    /// Encode this call into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        let h = self.header;
        enc.union_begin("Call")?;
        enc.record_begin()?;

        write_field(enc, "func", h.func)?;
        write_field(enc, "mode", &h.mode)?;
        write_field(enc, "sid", &h.sid)?;
        write_field(enc, "seq", &h.seq)?;
        write_field(enc, "start_ms", &h.start_ms)?;
        enc.field_begin("lib")?;
        h.lib.encode(enc)?;
        enc.field_end()?;
        write_field(enc, "silent", &h.silent)?;
        write_field(enc, "jobid", &h.jobid)?;
        write_raw_field(enc, "args", self.args)?;

        enc.record_end()?;
        enc.union_end()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// Decodes an inbound Call frame.
///
/// **Invariant**: `args` is either empty or exactly one encoded item.
#[derive(Debug)]
pub struct CallDecoder<'a> {
    pub header: CallHeader<'a>,
    pub args: &'a [u8],
}

impl<'a> CallDecoder<'a> {
    /// Decode the payload of a `Call` union case.
    pub fn decode(mut dec: Decoder<'a>) -> Result<Self> {
        let mut fields = dec.record()?;
        let mut header = CallHeader::default();
        let mut func = None;
        let mut seq = None;
        let mut args: &[u8] = &[];

        while let Some((key, mut val)) = fields.next()? {
            match key {
                "func" => func = Some(val.str()?),
                "mode" => header.mode = CallMode::unpack(&mut val)?,
                "sid" => header.sid = val.u32()?,
                "seq" => seq = Some(val.u16()?),
                "start_ms" => header.start_ms = val.u64()?,
                "lib" => header.lib = LibFlags::decode(&mut val)?,
                "silent" => header.silent = val.bool()?,
                "jobid" => header.jobid = val.u64()?,
                "args" => args = val.next_raw()?,
                _ => {}
            }
        }

        header.func = func.ok_or(Error::MissingField("func"))?;
        header.seq = seq.ok_or(Error::MissingField("seq"))?;
        Ok(CallDecoder { header, args })
    }
}

/// The common output header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyHeader<'a> {
    /// Echo of the call's `seq`.
    pub seq: u16,
    pub errno: TeErrno,
    pub err_msg: &'a str,
    pub duration_us: u64,
    /// Job id of a deferred call, zero when not applicable.
    pub jobid: u64,
    /// The remote errno changed while the function ran.
    pub errno_changed: bool,
}

/// Encodes an outbound Reply frame.
pub struct ReplyEncoder<'a> {
    pub header: &'a ReplyHeader<'a>,
    pub out: &'a [u8],
}

impl<'a> ReplyEncoder<'a> {
    pub fn new(header: &'a ReplyHeader<'a>, out: &'a [u8]) -> Self {
        Self { header, out }
    }

    /// Encode this reply into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        let h = self.header;
        enc.union_begin("Reply")?;
        enc.record_begin()?;

        write_field(enc, "seq", &h.seq)?;
        write_field(enc, "errno", &h.errno.raw())?;
        if !h.err_msg.is_empty() {
            write_field(enc, "err_msg", h.err_msg)?;
        }
        write_field(enc, "duration_us", &h.duration_us)?;
        write_field(enc, "jobid", &h.jobid)?;
        write_field(enc, "errno_changed", &h.errno_changed)?;
        write_raw_field(enc, "out", self.out)?;

        enc.record_end()?;
        enc.union_end()?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// Decodes an inbound Reply frame.
///
/// **Invariant**: `out` is either empty or exactly one encoded item.
#[derive(Debug)]
pub struct ReplyDecoder<'a> {
    pub header: ReplyHeader<'a>,
    pub out: &'a [u8],
}

impl<'a> ReplyDecoder<'a> {
    /// Decode the payload of a `Reply` union case.
    pub fn decode(mut dec: Decoder<'a>) -> Result<Self> {
        let mut fields = dec.record()?;
        let mut header = ReplyHeader::default();
        let mut seq = None;
        let mut out: &[u8] = &[];

        while let Some((key, mut val)) = fields.next()? {
            match key {
                "seq" => seq = Some(val.u16()?),
                "errno" => header.errno = TeErrno::from_raw(val.u32()?),
                "err_msg" => header.err_msg = val.str()?,
                "duration_us" => header.duration_us = val.u64()?,
                "jobid" => header.jobid = val.u64()?,
                "errno_changed" => header.errno_changed = val.bool()?,
                "out" => out = val.next_raw()?,
                _ => {}
            }
        }

        header.seq = seq.ok_or(Error::MissingField("seq"))?;
        Ok(ReplyDecoder { header, out })
    }
}

/// Top-level frame decoder.
#[derive(Debug)]
pub enum RpcFrame<'a> {
    Call(CallDecoder<'a>),
    Reply(ReplyDecoder<'a>),
}

impl<'a> RpcFrame<'a> {
    /// Decode an RPC frame spanning the whole buffer.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, body) = dec.union()?;
        dec.finish()?;
        match kind {
            "Call" => Ok(RpcFrame::Call(CallDecoder::decode(body)?)),
            "Reply" => Ok(RpcFrame::Reply(ReplyDecoder::decode(body)?)),
            other => Err(Error::UnknownVariant(format!("top-level frame: {}", other))),
        }
    }
}

/// Decodes just the sequence number from a raw frame, for frames whose
/// other header fields do not decode.
pub fn decode_seq(bytes: &[u8]) -> Result<u16> {
    let mut dec = Decoder::new(bytes);
    let (kind, mut body) = dec.union()?;
    if kind != "Call" && kind != "Reply" {
        return Err(Error::UnknownVariant(format!("top-level frame: {}", kind)));
    }

    let mut fields = body.record()?;
    while let Some((key, mut val)) = fields.next()? {
        if key == "seq" {
            return Ok(val.u16()?);
        }
    }

    Err(Error::MissingField("seq"))
}

// Helper functions

fn write_field<T: Pack + ?Sized>(enc: &mut Encoder, key: &str, val: &T) -> Result<()> {
    enc.field_begin(key)?;
    val.pack(enc)?;
    enc.field_end()?;
    Ok(())
}

/// Splices an already encoded record in as a field. Empty means absent.
fn write_raw_field(enc: &mut Encoder, key: &str, raw: &[u8]) -> Result<()> {
    if raw.is_empty() {
        return Ok(());
    }
    enc.field_begin(key)?;
    enc.raw(raw)?;
    enc.field_end()?;
    Ok(())
}
