//! Attribute codec: flat id/value lists to and from expanded tuples.
//!
//! Every per-attribute read or write dispatches on [`AttrCodec`], which the
//! descriptor builder fixed when the table was defined.

use tupl_error::{Result, TuplError};
use tupl_types::{AttrId, AttrValue, bytes_to_words, words_to_bytes};

use crate::collation::CollationRegistry;
use crate::schema::{AttrCodec, AttrDescriptor, AttrMask, SizeClass, TableDescriptor};
use crate::tuple::ExpandedTuple;

/// Output form for charset-aware attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum ReadMode {
    /// Stored bytes.
    #[default]
    Raw,
    /// Collation-normalized bytes; the length may differ from the stored one.
    Comparable,
}

/// Which write rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Primary key attributes may be set.
    Insert,
    /// Primary key attributes may only be rewritten with identical bytes.
    Update,
}

/// Raw value of one attribute, `None` for NULL.
pub fn read_attr(
    desc: &TableDescriptor,
    src: &ExpandedTuple,
    attr: &AttrDescriptor,
) -> Result<Option<Vec<u8>>> {
    if src.is_null(desc, attr)? {
        return Ok(None);
    }
    let bytes = match (attr.codec, attr.size) {
        (
            AttrCodec::FixedNotNull | AttrCodec::FixedNullable,
            SizeClass::Fixed { bytes },
        ) => fixed_bytes(&src.fixed, attr.offset as usize, bytes as usize)?,
        (AttrCodec::VarNotNull | AttrCodec::VarNullable, _) => src
            .var
            .as_ref()
            .ok_or_else(|| TuplError::internal("row has no variable part"))?
            .get(attr.offset as usize)
            .to_vec(),
        (
            AttrCodec::DiskFixedNotNull | AttrCodec::DiskFixedNullable,
            SizeClass::Fixed { bytes },
        ) => fixed_bytes(&src.disk_part()?.fixed, attr.offset as usize, bytes as usize)?,
        (AttrCodec::DiskVarNotNull | AttrCodec::DiskVarNullable, _) => src
            .disk_part()?
            .var
            .as_ref()
            .ok_or_else(|| TuplError::internal("disk part has no variable section"))?
            .get(attr.offset as usize)
            .to_vec(),
        _ => {
            return Err(TuplError::internal(format!(
                "codec {:?} does not match size class of {}",
                attr.codec, attr.id
            )));
        }
    };
    Ok(Some(bytes))
}

fn fixed_bytes(words: &[u32], offset: usize, len: usize) -> Result<Vec<u8>> {
    let end = offset + len.div_ceil(4);
    let slice = words
        .get(offset..end)
        .ok_or_else(|| TuplError::malformed(format!("fixed attribute at word {offset} out of range")))?;
    words_to_bytes(slice, len).ok_or_else(|| TuplError::malformed("short fixed attribute"))
}

/// Read `ids` in order, failing once the output exceeds `budget_words`.
pub fn read_attrs(
    desc: &TableDescriptor,
    collations: &CollationRegistry,
    src: &ExpandedTuple,
    ids: &[AttrId],
    budget_words: usize,
    mode: ReadMode,
) -> Result<Vec<AttrValue>> {
    let mut out = Vec::with_capacity(ids.len());
    let mut used = 0usize;
    for &id in ids {
        let attr = desc.attr(id)?;
        let mut data = read_attr(desc, src, attr)?;
        if let (ReadMode::Comparable, Some(coll_id), Some(bytes)) =
            (mode, attr.collation, data.as_ref())
        {
            let normalized = collations
                .get(coll_id)?
                .normalize(bytes)
                .ok_or(TuplError::InvalidFormat { attr: id.get() })?;
            data = Some(normalized);
        }
        let value = AttrValue::new(id, data);
        used += value.wire_words();
        if used > budget_words {
            return Err(TuplError::OutputOverflow {
                needed: used,
                budget: budget_words,
            });
        }
        tracing::trace!(attr = %id, null = value.is_null(), "read attribute");
        out.push(value);
    }
    Ok(out)
}

/// Every attribute of the row in declaration order, with no budget.
pub fn read_all(desc: &TableDescriptor, src: &ExpandedTuple) -> Result<Vec<AttrValue>> {
    desc.attrs()
        .iter()
        .map(|a| Ok(AttrValue::new(a.id, read_attr(desc, src, a)?)))
        .collect()
}

/// Apply `values` to `target`, returning the set of attributes written.
///
/// On error the target may be partially written; callers work on a shadow
/// copy and discard it.
pub fn update_attrs(
    desc: &TableDescriptor,
    collations: &CollationRegistry,
    target: &mut ExpandedTuple,
    values: &[AttrValue],
    kind: WriteKind,
) -> Result<AttrMask> {
    let mut written = AttrMask::new();
    for value in values {
        let attr = desc.attr(value.id)?;
        write_attr(desc, collations, target, attr, value.data.as_deref(), kind)?;
        written.set(value.id);
    }
    Ok(written)
}

/// Write one attribute under the codec's rules.
pub fn write_attr(
    desc: &TableDescriptor,
    collations: &CollationRegistry,
    target: &mut ExpandedTuple,
    attr: &AttrDescriptor,
    data: Option<&[u8]>,
    kind: WriteKind,
) -> Result<()> {
    let raw_id = attr.id.get();
    let Some(bytes) = data else {
        if !attr.is_nullable() {
            return Err(TuplError::NullConstraintViolated { attr: raw_id });
        }
        if attr.primary_key && kind == WriteKind::Update {
            return Err(TuplError::PrimaryKeyImmutable { attr: raw_id });
        }
        clear_value(target, attr)?;
        tracing::trace!(attr = %attr.id, "set null");
        return target.set_null(desc, attr, true);
    };

    if attr.primary_key && kind == WriteKind::Update {
        let current = read_attr(desc, target, attr)?;
        if current.as_deref() != Some(bytes) {
            return Err(TuplError::PrimaryKeyImmutable { attr: raw_id });
        }
        return Ok(());
    }

    match attr.size {
        SizeClass::Fixed { bytes: expected } if bytes.len() != expected as usize => {
            return Err(TuplError::WrongAttributeSize {
                attr: raw_id,
                expected: expected as usize,
                actual: bytes.len(),
            });
        }
        SizeClass::Variable { max_bytes } if bytes.len() > max_bytes as usize => {
            return Err(TuplError::AttributeTooLong {
                attr: raw_id,
                max: max_bytes as usize,
                actual: bytes.len(),
            });
        }
        _ => {}
    }
    if let Some(coll_id) = attr.collation {
        if !collations.get(coll_id)?.is_valid(bytes) {
            return Err(TuplError::InvalidFormat { attr: raw_id });
        }
    }

    let offset = attr.offset as usize;
    match attr.codec {
        AttrCodec::FixedNotNull | AttrCodec::FixedNullable => {
            let words = bytes_to_words(bytes);
            target.fixed[offset..offset + words.len()].copy_from_slice(&words);
        }
        AttrCodec::VarNotNull | AttrCodec::VarNullable => target
            .var
            .as_mut()
            .ok_or_else(|| TuplError::internal("row has no variable part"))?
            .set(offset, bytes)?,
        AttrCodec::DiskFixedNotNull | AttrCodec::DiskFixedNullable => {
            let words = bytes_to_words(bytes);
            target.disk_part_mut()?.fixed[offset..offset + words.len()].copy_from_slice(&words);
        }
        AttrCodec::DiskVarNotNull | AttrCodec::DiskVarNullable => target
            .disk_part_mut()?
            .var
            .as_mut()
            .ok_or_else(|| TuplError::internal("disk part has no variable section"))?
            .set(offset, bytes)?,
    }
    tracing::trace!(attr = %attr.id, len = bytes.len(), "wrote attribute");
    target.set_null(desc, attr, false)
}

/// Drop the stored bytes of a variable attribute so a null packs to nothing.
fn clear_value(target: &mut ExpandedTuple, attr: &AttrDescriptor) -> Result<()> {
    let offset = attr.offset as usize;
    match attr.codec {
        AttrCodec::VarNotNull | AttrCodec::VarNullable => {
            if let Some(var) = target.var.as_mut() {
                var.set(offset, &[])?;
            }
        }
        AttrCodec::DiskVarNotNull | AttrCodec::DiskVarNullable => {
            if let Some(var) = target.disk_part_mut()?.var.as_mut() {
                var.set(offset, &[])?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Fail if a NOT NULL attribute is still null.
pub fn check_not_null(desc: &TableDescriptor, tuple: &ExpandedTuple) -> Result<()> {
    for id in desc.not_null().iter() {
        let attr = desc.attr(id)?;
        if tuple.is_null(desc, attr)? {
            return Err(TuplError::MissingNotNullAttribute { attr: id.get() });
        }
    }
    Ok(())
}

/// Primary key attributes of the row, in declaration order.
pub fn primary_key_image(desc: &TableDescriptor, src: &ExpandedTuple) -> Result<Vec<AttrValue>> {
    desc.primary_key()
        .iter()
        .map(|id| Ok(AttrValue::new(id, read_attr(desc, src, desc.attr(id)?)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collation::CollationId;
    use crate::schema::AttrSpec;
    use crate::tuple::shrink;
    use proptest::prelude::*;

    fn a(i: u16) -> AttrId {
        AttrId::new(i)
    }

    fn table() -> TableDescriptor {
        TableDescriptor::builder("people")
            .attr(AttrSpec::fixed("id", 4).primary_key())
            .attr(AttrSpec::fixed("age", 4))
            .attr(AttrSpec::var("name", 16).collation(CollationId::UTF8_CI))
            .attr(AttrSpec::fixed("score", 8).nullable())
            .attr(AttrSpec::var("note", 32).on_disk().nullable())
            .attr(AttrSpec::fixed("stamp", 4).on_disk())
            .build()
            .unwrap()
    }

    fn full_row(d: &TableDescriptor, reg: &CollationRegistry) -> ExpandedTuple {
        let mut t = ExpandedTuple::blank(d);
        update_attrs(
            d,
            reg,
            &mut t,
            &[
                AttrValue::u32(a(0), 1),
                AttrValue::u32(a(1), 42),
                AttrValue::text(a(2), "Alice"),
                AttrValue::u64(a(3), 9_000_000_000),
                AttrValue::text(a(4), "disk note"),
                AttrValue::u32(a(5), 77),
            ],
            WriteKind::Insert,
        )
        .unwrap();
        t
    }

    #[test]
    fn test_insert_then_read_all() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let t = full_row(&d, &reg);
        check_not_null(&d, &t).unwrap();
        let vals = read_attrs(&d, &reg, &t, &[a(2), a(0), a(3), a(4), a(5)], 64, ReadMode::Raw)
            .unwrap();
        assert_eq!(vals[0].as_str(), Some("Alice"));
        assert_eq!(vals[1].as_u32(), Some(1));
        assert_eq!(vals[2].as_u64(), Some(9_000_000_000));
        assert_eq!(vals[3].as_str(), Some("disk note"));
        assert_eq!(vals[4].as_u32(), Some(77));
    }

    #[test]
    fn test_comparable_read_normalizes() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let t = full_row(&d, &reg);
        let vals = read_attrs(&d, &reg, &t, &[a(2)], 64, ReadMode::Comparable).unwrap();
        assert_eq!(vals[0].as_str(), Some("alice"));
    }

    #[test]
    fn test_comparable_read_rejects_corrupt_text() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = full_row(&d, &reg);
        let slot = d.attr(a(2)).unwrap().offset as usize;
        t.var.as_mut().unwrap().set(slot, &[0xff, 0xfe, 0x41]).unwrap();

        let err = read_attrs(&d, &reg, &t, &[a(2)], 64, ReadMode::Comparable).unwrap_err();
        assert_eq!(err, TuplError::InvalidFormat { attr: 2 });
        // raw reads hand the bytes back untouched
        let raw = read_attrs(&d, &reg, &t, &[a(2)], 64, ReadMode::Raw).unwrap();
        assert_eq!(raw[0].data.as_deref(), Some(&[0xff, 0xfe, 0x41][..]));
    }

    #[test]
    fn test_null_releases_variable_bytes() {
        let d = TableDescriptor::builder("blobs")
            .attr(AttrSpec::fixed("id", 4).primary_key())
            .attr(AttrSpec::var("data", 64).nullable())
            .attr(AttrSpec::var("extra", 64).on_disk().nullable())
            .build()
            .unwrap();
        let reg = CollationRegistry::with_builtins();
        let mut fresh = ExpandedTuple::blank(&d);
        update_attrs(&d, &reg, &mut fresh, &[AttrValue::u32(a(0), 1)], WriteKind::Insert).unwrap();

        let mut t = fresh.clone();
        update_attrs(
            &d,
            &reg,
            &mut t,
            &[AttrValue::new(a(1), Some(vec![7; 64])), AttrValue::new(a(2), Some(vec![8; 64]))],
            WriteKind::Update,
        )
        .unwrap();
        assert!(t.var_packed_words() > fresh.var_packed_words());
        update_attrs(&d, &reg, &mut t, &[AttrValue::null(a(1)), AttrValue::null(a(2))], WriteKind::Update)
            .unwrap();

        assert_eq!(t.var_packed_words(), fresh.var_packed_words());
        assert_eq!(t.disk_packed_words(), fresh.disk_packed_words());
        assert_eq!(shrink(&t).var_words(), shrink(&fresh).var_words());
        assert_eq!(shrink(&t), shrink(&fresh));
        assert!(read_attrs(&d, &reg, &t, &[a(1), a(2)], 64, ReadMode::Raw)
            .unwrap()
            .iter()
            .all(AttrValue::is_null));
    }

    #[test]
    fn test_output_budget_overflow() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let t = full_row(&d, &reg);
        // id: 2 words, name "Alice": 1 + 2 words
        assert!(read_attrs(&d, &reg, &t, &[a(0), a(2)], 5, ReadMode::Raw).is_ok());
        let err = read_attrs(&d, &reg, &t, &[a(0), a(2)], 4, ReadMode::Raw).unwrap_err();
        assert_eq!(err, TuplError::OutputOverflow { needed: 5, budget: 4 });
    }

    #[test]
    fn test_null_into_not_null_rejected() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = ExpandedTuple::blank(&d);
        let err = update_attrs(&d, &reg, &mut t, &[AttrValue::null(a(1))], WriteKind::Insert)
            .unwrap_err();
        assert_eq!(err, TuplError::NullConstraintViolated { attr: 1 });
    }

    #[test]
    fn test_nullable_round_trip() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = full_row(&d, &reg);
        update_attrs(
            &d,
            &reg,
            &mut t,
            &[AttrValue::null(a(3)), AttrValue::null(a(4))],
            WriteKind::Update,
        )
        .unwrap();
        let vals = read_attrs(&d, &reg, &t, &[a(3), a(4)], 64, ReadMode::Raw).unwrap();
        assert!(vals.iter().all(AttrValue::is_null));
    }

    #[test]
    fn test_primary_key_immutable_on_update() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = full_row(&d, &reg);
        update_attrs(&d, &reg, &mut t, &[AttrValue::u32(a(0), 1)], WriteKind::Update).unwrap();
        let err = update_attrs(&d, &reg, &mut t, &[AttrValue::u32(a(0), 2)], WriteKind::Update)
            .unwrap_err();
        assert_eq!(err, TuplError::PrimaryKeyImmutable { attr: 0 });
    }

    #[test]
    fn test_size_checks() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = ExpandedTuple::blank(&d);
        assert_eq!(
            update_attrs(&d, &reg, &mut t, &[AttrValue::u64(a(1), 1)], WriteKind::Insert)
                .unwrap_err(),
            TuplError::WrongAttributeSize {
                attr: 1,
                expected: 4,
                actual: 8
            }
        );
        assert_eq!(
            update_attrs(
                &d,
                &reg,
                &mut t,
                &[AttrValue::text(a(2), "seventeen chars!!")],
                WriteKind::Insert
            )
            .unwrap_err(),
            TuplError::AttributeTooLong {
                attr: 2,
                max: 16,
                actual: 17
            }
        );
    }

    #[test]
    fn test_invalid_charset_rejected() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = ExpandedTuple::blank(&d);
        let err = update_attrs(
            &d,
            &reg,
            &mut t,
            &[AttrValue::bytes(a(2), vec![0xff, 0xfe])],
            WriteKind::Insert,
        )
        .unwrap_err();
        assert_eq!(err, TuplError::InvalidFormat { attr: 2 });
    }

    #[test]
    fn test_missing_not_null() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let mut t = ExpandedTuple::blank(&d);
        update_attrs(
            &d,
            &reg,
            &mut t,
            &[AttrValue::u32(a(0), 1), AttrValue::u32(a(1), 2)],
            WriteKind::Insert,
        )
        .unwrap();
        assert_eq!(
            check_not_null(&d, &t).unwrap_err(),
            TuplError::MissingNotNullAttribute { attr: 2 }
        );
    }

    #[test]
    fn test_unknown_attribute() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let t = ExpandedTuple::blank(&d);
        assert_eq!(
            read_attrs(&d, &reg, &t, &[a(40)], 64, ReadMode::Raw).unwrap_err(),
            TuplError::NoSuchAttribute { attr: 40 }
        );
    }

    #[test]
    fn test_primary_key_image() {
        let d = table();
        let reg = CollationRegistry::with_builtins();
        let t = full_row(&d, &reg);
        let pk = primary_key_image(&d, &t).unwrap();
        assert_eq!(pk, vec![AttrValue::u32(a(0), 1)]);
        assert_eq!(read_all(&d, &t).unwrap().len(), 6);
    }

    proptest! {
        #[test]
        fn prop_fixed_not_null_read_after_update(
            vals in proptest::collection::vec(any::<u32>(), 1..8),
            wide in any::<u64>(),
        ) {
            let mut b = TableDescriptor::builder("p")
                .attr(AttrSpec::fixed("k", 4).primary_key());
            for i in 0..vals.len() {
                b = b.attr(AttrSpec::fixed(format!("c{i}"), 4));
            }
            let d = b.attr(AttrSpec::fixed("w", 8)).build().unwrap();
            let reg = CollationRegistry::with_builtins();
            let w_id = a(u16::try_from(vals.len() + 1).unwrap());

            let mut input = vec![AttrValue::u32(a(0), 0)];
            for (i, v) in vals.iter().enumerate() {
                input.push(AttrValue::u32(a(u16::try_from(i + 1).unwrap()), *v));
            }
            input.push(AttrValue::u64(w_id, wide));

            let mut t = ExpandedTuple::blank(&d);
            update_attrs(&d, &reg, &mut t, &input, WriteKind::Insert).unwrap();
            let ids: Vec<AttrId> = input.iter().map(|v| v.id).collect();
            let out = read_attrs(&d, &reg, &t, &ids, 1024, ReadMode::Raw).unwrap();
            prop_assert_eq!(out, input);
        }
    }
}
