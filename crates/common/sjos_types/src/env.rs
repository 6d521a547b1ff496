use core::{fmt, num::NonZero, str::FromStr};

use sjos_kernel_params::{LOG2NENV, NENV};

/// Bit position of the generation counter inside an [`EnvId`].
pub const ENVGENSHIFT: u32 = 12;

const _: () = assert!(LOG2NENV as u32 <= ENVGENSHIFT);

/// Identifier of an environment.
///
/// The low bits select a slot of the environment table and the remaining
/// bits hold a generation counter that changes every time the slot is
/// reused, so an identifier naming a previous occupant of the slot no
/// longer matches. Identifiers are always positive when viewed as `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EnvId(NonZero<u32>);

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<EnvId> for u32 {
    fn from(value: EnvId) -> Self {
        value.0.get()
    }
}

impl EnvId {
    const GENERATION_MASK: u32 = !((1 << ENVGENSHIFT) - 1);
    const FIRST_GENERATION: u32 = 1 << ENVGENSHIFT;

    /// Returns the identifier given to the next occupant of slot `index`.
    ///
    /// `prev` is the identifier of the slot's previous occupant, if any.
    /// The generation wraps back to 1 before the identifier would become
    /// negative.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot index.
    #[must_use]
    pub const fn next_generation(prev: Option<Self>, index: usize) -> Self {
        assert!(index < NENV);
        let prev = match prev {
            Some(id) => id.0.get(),
            None => 0,
        };
        let mut generation = (prev & Self::GENERATION_MASK).wrapping_add(Self::FIRST_GENERATION);
        if generation == 0 || generation > i32::MAX as u32 {
            generation = Self::FIRST_GENERATION;
        }
        #[expect(clippy::cast_possible_truncation)]
        let raw = generation | index as u32;
        // SAFETY: generation is at least `FIRST_GENERATION`.
        Self(unsafe { NonZero::new_unchecked(raw) })
    }

    /// Converts a raw identifier received from user space.
    ///
    /// Returns `None` for 0, which names the calling environment.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZero::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> NonZero<u32> {
        self.0
    }

    /// Returns the environment table slot this identifier refers to.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0.get() as usize & (NENV - 1)
    }

    #[must_use]
    pub const fn generation(self) -> u32 {
        self.0.get() >> ENVGENSHIFT
    }
}

impl FromStr for EnvId {
    type Err = <NonZero<u32> as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_generation() {
        let id = EnvId::next_generation(None, 5);
        assert_eq!(id.index(), 5);
        assert_eq!(id.generation(), 1);
        assert_eq!(u32::from(id), 0x1005);
    }

    #[test]
    fn test_generation_changes_on_reuse() {
        let first = EnvId::next_generation(None, 7);
        let second = EnvId::next_generation(Some(first), 7);
        assert_eq!(second.index(), 7);
        assert_eq!(second.generation(), 2);
        assert_ne!(first, second);
    }

    #[test]
    fn test_generation_wraps_before_sign_bit() {
        let last = EnvId::from_raw(0x7fff_f000 | 3).unwrap();
        let next = EnvId::next_generation(Some(last), 3);
        assert_eq!(next.generation(), 1);
        assert_eq!(next.index(), 3);
        assert!(i32::try_from(u32::from(next)).is_ok());
    }

    #[test]
    fn test_zero_names_caller() {
        assert_eq!(EnvId::from_raw(0), None);
        assert_eq!("4097".parse::<EnvId>().unwrap().index(), 1);
    }
}
