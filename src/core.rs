use std::any::{Any, TypeId};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

/// A type-erased, thread-safe payload carried by a pin.
///
/// The scheduler never looks inside; it only compares the declared
/// [`DataType`] and [`Flags`] of the pin holding it.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Marker type backing [`DataType::any`].
struct AnyData;

/// The declared type of a pin.
///
/// Two data types are equal when they name the same Rust type. Assignability
/// is identity, except for the wildcard [`DataType::any`] which accepts every
/// candidate.
#[derive(Clone, Copy)]
pub struct DataType {
    id: TypeId,
    name: &'static str,
}

impl DataType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Wildcard type, assignable from anything.
    pub fn any() -> Self {
        Self {
            id: TypeId::of::<AnyData>(),
            name: "*",
        }
    }

    pub fn is_any(&self) -> bool {
        self.id == TypeId::of::<AnyData>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// Full type name, as reported by [`std::any::type_name`].
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name, used in labels.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        let start = base.rfind("::").map(|i| i + 2).unwrap_or(0);
        &self.name[start..]
    }

    /// Whether a value of type `other` may flow into a slot of this type.
    pub fn is_assignable_from(&self, other: &DataType) -> bool {
        self.is_any() || self.id == other.id
    }
}

impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DataType {}

impl std::hash::Hash for DataType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataType({})", self.name)
    }
}

/// An opaque tag set attached to a pin, used to route by capability
/// independently of the declared type.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flags(u32);

impl Flags {
    pub const EMPTY: Flags = Flags(0);

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    /// A set holding only bit `n`.
    pub const fn bit(n: u32) -> Self {
        Flags(1 << n)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }

    /// `true` when every bit of `required` is also set in `self`.
    pub const fn contains(self, required: Flags) -> bool {
        self.0 & required.0 == required.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#010x})", self.0)
    }
}

/// Ordering tier of a prototype.
///
/// `Before` and `After` prototypes are adapters that get spliced around a
/// `Primary` match; they are never matched on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum Tier {
    Before = 0,
    Primary = 1,
    After = 2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Before, Tier::Primary, Tier::After];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Before => f.write_str("before"),
            Tier::Primary => f.write_str("primary"),
            Tier::After => f.write_str("after"),
        }
    }
}

/// A 32-byte BLAKE3 hash used to fingerprint discovered projects.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Hashes a sequence of chunks, separating them so that `["ab", "c"]`
    /// and `["a", "bc"]` differ.
    pub(crate) fn hash_all<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for chunk in chunks {
            let chunk = chunk.as_ref();
            hasher.update(&(chunk.len() as u64).to_le_bytes());
            hasher.update(chunk);
        }
        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_contains() {
        let a = Flags::bit(0);
        let b = Flags::bit(3);

        assert!((a | b).contains(a));
        assert!((a | b).contains(a | b));
        assert!(!a.contains(a | b));
        assert!(a.contains(Flags::EMPTY));
        assert_eq!((a | b) & b, b);
    }

    #[test]
    fn test_data_type_assignability() {
        let string = DataType::of::<String>();
        let number = DataType::of::<u32>();

        assert!(string.is_assignable_from(&DataType::of::<String>()));
        assert!(!string.is_assignable_from(&number));
        assert!(DataType::any().is_assignable_from(&number));
        assert!(!number.is_assignable_from(&DataType::any()));
    }

    #[test]
    fn test_short_name() {
        assert_eq!(DataType::of::<String>().short_name(), "String");
        assert_eq!(DataType::of::<u32>().short_name(), "u32");
        assert_eq!(DataType::any().short_name(), "*");
    }

    #[test]
    fn test_hash_separates_chunks() {
        let a = Hash32::hash_all(["ab", "c"]);
        let b = Hash32::hash_all(["a", "bc"]);

        assert_ne!(a, b);
        assert_eq!(a, Hash32::hash_all(["ab", "c"]));
        assert_eq!(a.to_hex().len(), 64);
    }
}
