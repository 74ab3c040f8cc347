use crate::*;
use crate::render::Plain;
use crate::render::Render;
use crate::render::render_fields;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalars_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.bool(true)?;
    enc.u8(255)?;
    enc.u16(u16::MAX)?;
    enc.i32(i32::MIN)?;
    enc.u64(u64::MAX)?;
    enc.i64(-1)?;
    enc.unit()?;
    enc.none()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.bool()?);
    assert_eq!(dec.u8()?, 255);
    assert_eq!(dec.u16()?, u16::MAX);
    assert_eq!(dec.i32()?, i32::MIN);
    assert_eq!(dec.u64()?, u64::MAX);
    assert_eq!(dec.i64()?, -1);
    dec.unit()?;
    assert!(dec.option()?.is_none());
    dec.finish()
}

#[test]
fn test_random_ints_survive() -> Result<()> {
    for _ in 0..64 {
        let a: i32 = rand::random();
        let b: u64 = rand::random();
        let bytes = to_bytes(&vec![a])?;
        assert_eq!(from_bytes::<Vec<i32>>(&bytes)?, vec![a]);
        let bytes = to_bytes(&b)?;
        assert_eq!(from_bytes::<u64>(&bytes)?, b);
    }
    Ok(())
}

#[test]
fn test_strings_and_blobs() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("")?;
    enc.str("héllo")?;
    enc.bytes(&[0, 1, 2])?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.str()?, "");
    assert_eq!(dec.str()?, "héllo");
    assert_eq!(dec.bytes()?, &[0, 1, 2]);
    Ok(())
}

#[test]
fn test_wrong_tag_is_reported() -> Result<()> {
    let bytes = to_bytes(&7u32)?;
    let mut dec = Decoder::new(&bytes);
    match dec.i32() {
        Err(Error::UnexpectedTag { expected: Tag::S32, found: Tag::U32 }) => Ok(()),
        other => panic!("expected UnexpectedTag, got {:?}", other),
    }
}

// ============================================================================
//  RECORDS
// ============================================================================

#[derive(Debug, Default, PartialEq, Pack, Unpack)]
struct SendArgs {
    fd: i32,
    buf: ByteBuf,
    flags: u32,
}

#[derive(Debug, Default, PartialEq, Pack, Unpack)]
struct SendArgsV2 {
    fd: i32,
    buf: ByteBuf,
    flags: u32,
    deadline: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Pack, Unpack)]
struct Empty;

#[derive(Debug, PartialEq, Pack, Unpack)]
enum Addr {
    Any,
    Port(u16),
    Host(String),
}

impl Default for Addr {
    fn default() -> Self {
        Addr::Any
    }
}

#[derive(Debug, Default, PartialEq, Pack, Unpack)]
struct Bind {
    r#type: u8,
    addr: Addr,
    backlog: Vec<i32>,
}

#[test]
fn test_record_roundtrip() -> Result<()> {
    let args = SendArgs { fd: 3, buf: ByteBuf(b"ping".to_vec()), flags: 0x40 };
    let bytes = to_bytes(&args)?;
    assert_eq!(from_bytes::<SendArgs>(&bytes)?, args);
    Ok(())
}

#[test]
fn test_unknown_fields_are_skipped() -> Result<()> {
    let newer = SendArgsV2 {
        fd: 9,
        buf: ByteBuf(vec![1, 2]),
        flags: 1,
        deadline: Some(500),
    };
    let bytes = to_bytes(&newer)?;
    let older: SendArgs = from_bytes(&bytes)?;
    assert_eq!(older, SendArgs { fd: 9, buf: ByteBuf(vec![1, 2]), flags: 1 });
    Ok(())
}

#[test]
fn test_absent_fields_take_default() -> Result<()> {
    let older = SendArgs { fd: 4, buf: ByteBuf::default(), flags: 2 };
    let bytes = to_bytes(&older)?;
    let newer: SendArgsV2 = from_bytes(&bytes)?;
    assert_eq!(newer.fd, 4);
    assert_eq!(newer.flags, 2);
    assert_eq!(newer.deadline, None);
    Ok(())
}

#[test]
fn test_field_order_does_not_matter() -> Result<()> {
    let mut enc = Encoder::new();
    enc.record_begin()?;
    enc.field_begin("flags")?;
    enc.u32(8)?;
    enc.field_end()?;
    enc.field_begin("fd")?;
    enc.i32(-1)?;
    enc.field_end()?;
    enc.record_end()?;

    let args: SendArgs = from_bytes(&enc.into_bytes()?)?;
    assert_eq!(args, SendArgs { fd: -1, buf: ByteBuf::default(), flags: 8 });
    Ok(())
}

#[test]
fn test_unit_struct_is_empty_record() -> Result<()> {
    let bytes = to_bytes(&Empty)?;
    assert_eq!(bytes, vec![Tag::Record as u8, 0, 0, 0, 0]);
    assert_eq!(from_bytes::<Empty>(&bytes)?, Empty);
    // a unit struct still accepts fields it does not know
    let bytes = to_bytes(&SendArgs::default())?;
    assert_eq!(from_bytes::<Empty>(&bytes)?, Empty);
    Ok(())
}

#[test]
fn test_unions_and_raw_identifiers() -> Result<()> {
    for addr in [Addr::Any, Addr::Port(8080), Addr::Host("tester".into())] {
        let bind = Bind { r#type: 2, addr, backlog: vec![1, -1] };
        let bytes = to_bytes(&bind)?;
        assert_eq!(from_bytes::<Bind>(&bytes)?, bind);
    }

    let bytes = to_bytes(&Bind::default())?;
    let mut fields = Decoder::new(&bytes).record()?;
    let (name, _) = fields.next()?.ok_or(Error::UnexpectedEnd)?;
    assert_eq!(name, "type");
    Ok(())
}

#[test]
fn test_unknown_union_case() -> Result<()> {
    let mut enc = Encoder::new();
    enc.union_begin("Multicast")?;
    enc.unit()?;
    enc.union_end()?;
    match from_bytes::<Addr>(&enc.into_bytes()?) {
        Err(Error::UnknownVariant(name)) => assert_eq!(name, "Multicast"),
        other => panic!("expected UnknownVariant, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_trailing_bytes_rejected() -> Result<()> {
    let mut bytes = to_bytes(&1u8)?;
    bytes.push(Tag::Unit as u8);
    assert_eq!(from_bytes::<u8>(&bytes), Err(Error::TrailingBytes(1)));
    Ok(())
}

// ============================================================================
//  STRUCTURE
// ============================================================================

#[test]
fn test_record_only_takes_fields() {
    let mut enc = Encoder::new();
    enc.record_begin().unwrap();
    assert_eq!(enc.u32(1), Err(Error::NotAField));
}

#[test]
fn test_single_item_scopes() {
    let mut enc = Encoder::new();
    enc.some_begin().unwrap();
    assert_eq!(enc.some_end(), Err(Error::EmptyScope(Scope::Some)));

    let mut enc = Encoder::new();
    enc.record_begin().unwrap();
    enc.field_begin("x").unwrap();
    enc.u8(1).unwrap();
    assert_eq!(enc.u8(2), Err(Error::TooManyItems(Scope::Field)));

    let mut enc = Encoder::new();
    enc.union_begin("A").unwrap();
    assert_eq!(enc.union_end(), Err(Error::EmptyScope(Scope::Union)));
}

#[test]
fn test_scope_bookkeeping() {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end(), Err(Error::ScopeUnderflow));

    enc.list_begin().unwrap();
    assert_eq!(
        enc.record_end(),
        Err(Error::ScopeMismatch { expected: Scope::Record, actual: Scope::List })
    );
    assert_eq!(enc.into_bytes(), Err(Error::ScopeStillOpen));
}

#[test]
fn test_limit_is_enforced() {
    let mut enc = Encoder::with_limit(8);
    enc.u32(1).unwrap();
    assert_eq!(enc.str("too long"), Err(Error::BufferFull { limit: 8 }));
    // the failed write left nothing behind
    assert_eq!(enc.len(), 5);
}

#[test]
fn test_raw_splices_an_item() -> Result<()> {
    let inner = to_bytes(&SendArgs { fd: 1, ..Default::default() })?;
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.raw(&inner)?;
    enc.raw(&inner)?;
    enc.list_end()?;

    let all: Vec<SendArgs> = from_bytes(&enc.into_bytes()?)?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].fd, 1);
    Ok(())
}

// ============================================================================
//  DECODER FAILURE MODES
// ============================================================================

#[test]
fn test_fail_truncated() {
    let data = [0x10, 0x01];
    assert_eq!(Decoder::new(&data).str(), Err(Error::UnexpectedEnd));

    let mut data = vec![0x10];
    data.extend_from_slice(&100u32.to_le_bytes());
    data.push(b'a');
    assert_eq!(Decoder::new(&data).str(), Err(Error::UnexpectedEnd));
}

#[test]
fn test_fail_invalid_utf8() {
    let mut raw = to_bytes(&ByteBuf(vec![0xFF, 0xFE])).unwrap();
    raw[0] = Tag::String as u8;
    assert_eq!(Decoder::new(&raw).str(), Err(Error::InvalidUtf8));
}

#[test]
fn test_fail_invalid_tag() {
    let data = [0xFF, 0x00];
    assert_eq!(Decoder::new(&data).peek_tag(), Err(Error::InvalidTag(0xFF)));
}

#[test]
fn test_child_cannot_read_past_parent() -> Result<()> {
    let bytes = to_bytes(&vec![10u32])?;
    let mut list = Decoder::new(&bytes).list()?;
    let mut item = list.next()?.ok_or(Error::UnexpectedEnd)?;
    assert_eq!(item.u32()?, 10);
    assert_eq!(item.u32(), Err(Error::UnexpectedEnd));
    assert!(list.next()?.is_none());
    Ok(())
}

// ============================================================================
//  RENDER
// ============================================================================

#[test]
fn test_render_record_fields() -> Result<()> {
    let bind = Bind { r#type: 1, addr: Addr::Host("lo".into()), backlog: vec![] };
    let mut out = String::new();
    render_fields(&to_bytes(&bind)?, &mut out, &mut Plain)?;
    assert_eq!(out, "type=1, addr=Host(\"lo\"), backlog=[]");
    Ok(())
}

#[test]
fn test_render_values() -> Result<()> {
    let args = SendArgsV2 { fd: 5, buf: ByteBuf(vec![0; 3]), flags: 0, deadline: None };
    let mut out = String::new();
    render_fields(&to_bytes(&args)?, &mut out, &mut Plain)?;
    assert_eq!(out, "fd=5, buf=<3 bytes>, flags=0, deadline=NULL");

    let mut out = String::new();
    render_fields(&to_bytes(&Addr::Any)?, &mut out, &mut Plain)?;
    assert_eq!(out, "Any");

    let mut out = String::new();
    render_fields(&[], &mut out, &mut Plain)?;
    assert!(out.is_empty());
    Ok(())
}

struct Ports;

impl Render for Ports {
    fn union(&mut self, name: &str, mut payload: Decoder<'_>, out: &mut String) -> bool {
        if name != "Port" {
            return false;
        }
        match payload.u16() {
            Ok(port) => {
                out.push_str(&format!(":{}", port));
                true
            }
            Err(_) => false,
        }
    }
}

#[test]
fn test_render_hook_takes_over_union() -> Result<()> {
    let bind = Bind { r#type: 0, addr: Addr::Port(80), backlog: vec![3] };
    let mut out = String::new();
    render_fields(&to_bytes(&bind)?, &mut out, &mut Ports)?;
    assert_eq!(out, "type=0, addr=:80, backlog=[3]");
    Ok(())
}

#[derive(Debug, Default, PartialEq, Pack, Unpack)]
struct Retval {
    retval: i64,
}

/// A record `{retval, extra}` where `extra` is `levels` nested lists.
fn nested_reply(levels: usize) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.record_begin()?;
    enc.field_begin("retval")?;
    enc.i64(0)?;
    enc.field_end()?;
    enc.field_begin("extra")?;
    for _ in 0..levels {
        enc.list_begin()?;
    }
    for _ in 0..levels {
        enc.list_end()?;
    }
    enc.field_end()?;
    enc.record_end()?;
    enc.into_bytes()
}

#[test]
fn test_render_stops_at_depth_limit() -> Result<()> {
    let bytes = nested_reply(200_000)?;

    // unknown fields are skipped whole, so the record still decodes
    assert_eq!(from_bytes::<Retval>(&bytes)?, Retval { retval: 0 });

    let mut out = String::new();
    let rendered = render_fields(&bytes, &mut out, &mut Plain);
    assert_eq!(rendered, Err(Error::TooDeep { limit: render::MAX_DEPTH }));
    Ok(())
}

#[test]
fn test_render_within_depth_limit() -> Result<()> {
    // the record itself is one level, the field value adds the rest
    let bytes = nested_reply(render::MAX_DEPTH - 1)?;
    let mut out = String::new();
    render_fields(&bytes, &mut out, &mut Plain)?;
    let depth = render::MAX_DEPTH - 1;
    assert_eq!(out, format!("retval=0, extra={}{}", "[".repeat(depth), "]".repeat(depth)));

    let bytes = nested_reply(render::MAX_DEPTH)?;
    let mut out = String::new();
    assert!(render_fields(&bytes, &mut out, &mut Plain).is_err());
    Ok(())
}
