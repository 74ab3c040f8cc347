//! Schema-agnostic rendering of encoded values for log lines.
//!
//! Records render as `name=value` pairs, lists as `[a, b]`, strings quoted,
//! blobs as `<N bytes>`, `None` as `NULL` and union cases as `Case` or
//! `Case(payload)`. A `Render` hook may take over any union case, which is
//! how higher layers print their own wire types.
//!
//! Containers nested deeper than `MAX_DEPTH` fail with `Error::TooDeep`
//! instead of being followed.

use std::fmt::Write;

use crate::decoder::Decoder;
use crate::types::Error;
use crate::types::Result;
use crate::types::Tag;

/// Deepest container nesting the renderer follows.
pub const MAX_DEPTH: usize = 64;

/// Rendering hook for union cases.
pub trait Render {
    /// Renders the union case `name` into `out` and returns `true`, or
    /// returns `false` to fall back to the generic form.
    fn union(&mut self, name: &str, payload: Decoder<'_>, out: &mut String) -> bool;
}

/// The hook that never intervenes.
pub struct Plain;

impl Render for Plain {
    fn union(&mut self, _name: &str, _payload: Decoder<'_>, _out: &mut String) -> bool {
        false
    }
}

/// Renders the fields of a top-level record without surrounding braces,
/// or any other single value as is.
pub fn render_fields(bytes: &[u8], out: &mut String, hook: &mut dyn Render) -> Result<()> {
    let mut dec = Decoder::new(bytes);
    if dec.is_empty() {
        return Ok(());
    }
    if dec.peek_tag()? == Tag::Record {
        let mut fields = dec.record()?;
        render_field_list(&mut fields, out, hook, 1)
    } else {
        render_nested(&mut dec, out, hook, 0)
    }
}

fn render_field_list(
    fields: &mut crate::decoder::FieldIter<'_>,
    out: &mut String,
    hook: &mut dyn Render,
    depth: usize,
) -> Result<()> {
    let mut first = true;
    while let Some((name, mut value)) = fields.next()? {
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(name);
        out.push('=');
        render_nested(&mut value, out, hook, depth)?;
    }
    Ok(())
}

/// Renders exactly one value.
pub fn render_value(dec: &mut Decoder<'_>, out: &mut String, hook: &mut dyn Render) -> Result<()> {
    render_nested(dec, out, hook, 0)
}

/// Renders one value found `depth` containers down.
fn render_nested(dec: &mut Decoder<'_>, out: &mut String, hook: &mut dyn Render, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(Error::TooDeep { limit: MAX_DEPTH });
    }
    let depth = depth + 1;
    // write! into a String cannot fail
    match dec.peek_tag()? {
        Tag::BoolTrue | Tag::BoolFalse => { let _ = write!(out, "{}", dec.bool()?); }
        Tag::U8 => { let _ = write!(out, "{}", dec.u8()?); }
        Tag::U16 => { let _ = write!(out, "{}", dec.u16()?); }
        Tag::U32 => { let _ = write!(out, "{}", dec.u32()?); }
        Tag::U64 => { let _ = write!(out, "{}", dec.u64()?); }
        Tag::S8 => { let _ = write!(out, "{}", dec.i8()?); }
        Tag::S16 => { let _ = write!(out, "{}", dec.i16()?); }
        Tag::S32 => { let _ = write!(out, "{}", dec.i32()?); }
        Tag::S64 => { let _ = write!(out, "{}", dec.i64()?); }
        Tag::Unit => { dec.unit()?; out.push_str("()"); }
        Tag::None => { dec.option()?; out.push_str("NULL"); }
        Tag::Some => {
            if let Some(mut inner) = dec.option()? {
                render_nested(&mut inner, out, hook, depth)?;
            }
        }
        Tag::String => { let _ = write!(out, "{:?}", dec.str()?); }
        Tag::Bytes => { let _ = write!(out, "<{} bytes>", dec.bytes()?.len()); }
        Tag::List => {
            let mut items = dec.list()?;
            out.push('[');
            let mut first = true;
            while let Some(mut item) = items.next()? {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                render_nested(&mut item, out, hook, depth)?;
            }
            out.push(']');
        }
        Tag::Record => {
            let mut fields = dec.record()?;
            out.push('{');
            render_field_list(&mut fields, out, hook, depth)?;
            out.push('}');
        }
        Tag::Union => {
            let (name, mut payload) = dec.union()?;
            if !hook.union(name, payload.clone(), out) {
                out.push_str(name);
                if payload.peek_tag()? != Tag::Unit {
                    out.push('(');
                    render_nested(&mut payload, out, hook, depth)?;
                    out.push(')');
                }
            }
        }
        Tag::Field => {
            // a bare field outside a record is malformed, show it anyway
            let raw = dec.next_raw()?;
            let _ = write!(out, "<field {} bytes>", raw.len());
        }
    }
    Ok(())
}
