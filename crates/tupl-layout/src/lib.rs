//! Tuple layout and attribute codec.
//!
//! A row is a fixed part of 32-bit words (header, checksum, null bitmap,
//! part references, fixed attributes), an optional memory variable part and
//! an optional disk mirror. [`schema`] lays these out once per table,
//! [`tuple`] converts between packed and expanded forms, and [`codec`] moves
//! attribute values in and out of expanded tuples.

pub mod codec;
pub mod collation;
pub mod header;
pub mod schema;
pub mod tuple;

pub use codec::{
    ReadMode, WriteKind, check_not_null, primary_key_image, read_all, read_attr, read_attrs,
    update_attrs, write_attr,
};
pub use collation::{
    BinaryCollation, Collation, CollationId, CollationRegistry, Utf8CaseInsensitive, like_match,
};
pub use header::{TupleFlags, TupleHeader};
pub use schema::{
    AttrCodec, AttrDescriptor, AttrMask, AttrSpec, CHECKSUM_WORD, HEADER_WORD, Placement,
    SizeClass, TableDescriptor, TableDescriptorBuilder,
};
pub use tuple::{
    DiskSection, ExpandedTuple, PackedTuple, VarRef, VarSection, compute_checksum, expand,
    packed_var_words, seal_checksum, shrink, verify_checksum,
};
