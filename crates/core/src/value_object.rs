//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are immutable: `Money`, `Currency` and
/// negotiation `Terms` are compared field by field and replaced, never edited.
/// A counter-offer swaps the whole `Terms` value instead of merging fields.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
