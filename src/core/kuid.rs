//! Kademlia identifier types.

use std::{cmp::Ordering, fmt, str::FromStr};

#[cfg(feature = "codec")]
use bincode::{Decode, Encode};
use rand::{thread_rng, Rng};

use crate::error::ParseKuidError;

/// A 160-bit identifier that implements a non-euclidian XOR-based distance metric.
///
/// The bytes are big-endian: bit 0 is the most-significant bit of the first byte. The derived
/// ordering is therefore the numerical ordering of the unsigned integer the identifier encodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "codec", derive(Encode, Decode))]
pub struct Kuid {
    bytes: [u8; Self::BYTES],
}

impl Kuid {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 20;

    /// The size of the identifier in bits.
    pub const BITS: usize = Self::BYTES * 8;

    /// The all-zero identifier.
    pub const ZERO: Kuid = Kuid {
        bytes: [0u8; Self::BYTES],
    };

    /// The largest representable identifier, 2^160 - 1.
    pub const MAX: Kuid = Kuid {
        bytes: [0xff; Self::BYTES],
    };

    /// Creates a new identifier from the supplied bytes.
    pub const fn new(bytes: [u8; Self::BYTES]) -> Self {
        Kuid { bytes }
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    /// Returns a reference to the bytes backing the identifier.
    pub fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.bytes
    }

    /// Creates an identifier holding the supplied integer in its low-order bytes.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - 8..].copy_from_slice(&value.to_be_bytes());

        Self { bytes }
    }

    /// Generates a uniformly random identifier.
    pub fn rand() -> Self {
        Self::random_with(&mut thread_rng())
    }

    /// Generates a uniformly random identifier from the supplied generator.
    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; Self::BYTES];
        rng.fill(&mut bytes[..]);

        Self { bytes }
    }

    /// Generates a random identifier whose leading `depth` bits are those of `prefix`.
    pub fn random_within(prefix: &Kuid, depth: usize) -> Self {
        let mut id = Self::rand();
        let depth = depth.min(Self::BITS);
        let whole = depth / 8;
        let rem = depth % 8;

        id.bytes[..whole].copy_from_slice(&prefix.bytes[..whole]);

        if rem > 0 {
            let mask = 0xffu8 << (8 - rem);
            id.bytes[whole] = (prefix.bytes[whole] & mask) | (id.bytes[whole] & !mask);
        }

        id
    }

    /// Returns the XOR distance between two identifiers.
    pub fn distance(&self, other: &Kuid) -> Kuid {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }

        Kuid { bytes }
    }

    /// Compares `a` and `b` by their distance to `self`: `Less` means `a` is the closer of the
    /// two.
    pub fn cmp_distance(&self, a: &Kuid, b: &Kuid) -> Ordering {
        self.bytes
            .iter()
            .zip(a.bytes.iter().zip(b.bytes.iter()))
            .map(|(t, (a, b))| (t ^ a).cmp(&(t ^ b)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Returns the value of the n-th bit, counting from the most-significant one.
    pub fn bit(&self, n: usize) -> bool {
        debug_assert!(n < Self::BITS);
        self.bytes[n / 8] & (0x80 >> (n % 8)) != 0
    }

    /// Returns a copy of the identifier with the n-th bit set.
    pub fn with_bit(&self, n: usize) -> Kuid {
        debug_assert!(n < Self::BITS);
        let mut id = *self;
        id.bytes[n / 8] |= 0x80 >> (n % 8);

        id
    }

    /// Returns the number of leading bits both identifiers have in common.
    pub fn common_prefix_len(&self, other: &Kuid) -> usize {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| *byte != 0)
            .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
            .unwrap_or(Self::BITS)
    }

    /// Returns whether the leading `n` bits of both identifiers match.
    pub fn match_nth(&self, other: &Kuid, n: usize) -> bool {
        self.common_prefix_len(other) >= n
    }

    /// Returns the most-significant byte, used to partition the space into subspaces.
    pub fn leading_byte(&self) -> u8 {
        self.bytes[0]
    }

    /// Returns `true` if every bit is zero.
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }

    // ARITHMETIC

    /// Adds two identifiers as unsigned integers, returning the truncated sum and whether a carry
    /// out of the most-significant bit occurred.
    pub fn overflowing_add(&self, other: &Kuid) -> (Kuid, bool) {
        let mut bytes = [0u8; Self::BYTES];
        let mut carry = 0u16;

        for i in (0..Self::BYTES).rev() {
            let sum = self.bytes[i] as u16 + other.bytes[i] as u16 + carry;
            bytes[i] = sum as u8;
            carry = sum >> 8;
        }

        (Kuid { bytes }, carry != 0)
    }

    /// Subtracts `other`, wrapping around at the boundary of the type.
    pub fn wrapping_sub(&self, other: &Kuid) -> Kuid {
        let mut bytes = [0u8; Self::BYTES];
        let mut borrow = 0i16;

        for i in (0..Self::BYTES).rev() {
            let mut diff = self.bytes[i] as i16 - other.bytes[i] as i16 - borrow;
            borrow = 0;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            }
            bytes[i] = diff as u8;
        }

        Kuid { bytes }
    }

    /// Multiplies two identifiers as unsigned integers, returning the low 160 bits of the product
    /// and whether any higher bit was set.
    pub fn overflowing_mul(&self, other: &Kuid) -> (Kuid, bool) {
        let a = self.limbs();
        let b = other.limbs();
        let mut product = [0u32; 2 * Self::LIMBS];

        for i in 0..Self::LIMBS {
            let mut carry = 0u64;
            for j in 0..Self::LIMBS {
                let t = a[i] as u64 * b[j] as u64 + product[i + j] as u64 + carry;
                product[i + j] = t as u32;
                carry = t >> 32;
            }
            product[i + Self::LIMBS] = carry as u32;
        }

        let overflow = product[Self::LIMBS..].iter().any(|&limb| limb != 0);
        let mut low = [0u32; Self::LIMBS];
        low.copy_from_slice(&product[..Self::LIMBS]);

        (Self::from_limbs(low), overflow)
    }

    /// Divides by `divisor`, returning the quotient and the remainder, or `None` when dividing by
    /// zero.
    pub fn div_rem(&self, divisor: &Kuid) -> Option<(Kuid, Kuid)> {
        if divisor.is_zero() {
            return None;
        }

        let mut quotient = Kuid::ZERO;
        let mut remainder = Kuid::ZERO;

        for n in 0..Self::BITS {
            let (shifted, carried) = remainder.shl1(self.bit(n));
            remainder = shifted;

            // A carried-out bit means the true remainder exceeds 2^160 and therefore the divisor.
            if carried || remainder >= *divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient = quotient.with_bit(n);
            }
        }

        Some((quotient, remainder))
    }

    /// Approximates the identifier as a floating point number.
    pub fn to_f64(&self) -> f64 {
        self.bytes
            .iter()
            .fold(0f64, |acc, &byte| acc * 256.0 + byte as f64)
    }

    /// Returns the identifier as an integer, saturating at `u64::MAX`.
    pub fn to_u64_saturating(&self) -> u64 {
        let (high, low) = self.bytes.split_at(Self::BYTES - 8);
        if high.iter().any(|&b| b != 0) {
            return u64::MAX;
        }

        let mut buf = [0u8; 8];
        buf.copy_from_slice(low);
        u64::from_be_bytes(buf)
    }

    /// Returns the big-endian bytes with the leading zero bytes stripped, the compact form used
    /// when publishing the value to peers.
    pub fn to_compact_bytes(&self) -> Vec<u8> {
        let start = self
            .bytes
            .iter()
            .position(|&b| b != 0)
            .unwrap_or(Self::BYTES);

        self.bytes[start..].to_vec()
    }

    /// Parses the compact form produced by [`Kuid::to_compact_bytes`].
    pub fn from_compact_bytes(compact: &[u8]) -> Option<Kuid> {
        if compact.len() > Self::BYTES {
            return None;
        }

        let mut bytes = [0u8; Self::BYTES];
        bytes[Self::BYTES - compact.len()..].copy_from_slice(compact);

        Some(Kuid { bytes })
    }

    const LIMBS: usize = Self::BYTES / 4;

    // Little-endian 32-bit limbs.
    fn limbs(&self) -> [u32; Self::LIMBS] {
        let mut limbs = [0u32; Self::LIMBS];
        for (k, limb) in limbs.iter_mut().enumerate() {
            let end = Self::BYTES - 4 * k;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&self.bytes[end - 4..end]);
            *limb = u32::from_be_bytes(buf);
        }

        limbs
    }

    fn from_limbs(limbs: [u32; Self::LIMBS]) -> Kuid {
        let mut bytes = [0u8; Self::BYTES];
        for (k, limb) in limbs.iter().enumerate() {
            let end = Self::BYTES - 4 * k;
            bytes[end - 4..end].copy_from_slice(&limb.to_be_bytes());
        }

        Kuid { bytes }
    }

    // Shifts left by one bit, shifting `low` in and returning the bit shifted out.
    fn shl1(&self, low: bool) -> (Kuid, bool) {
        let mut bytes = [0u8; Self::BYTES];
        let mut carry = low as u8;

        for i in (0..Self::BYTES).rev() {
            bytes[i] = (self.bytes[i] << 1) | carry;
            carry = self.bytes[i] >> 7;
        }

        (Kuid { bytes }, carry != 0)
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.bytes))
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({})", hex::encode(&self.bytes[..8]))
    }
}

impl FromStr for Kuid {
    type Err = ParseKuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::BYTES * 2 {
            return Err(ParseKuidError::Length(s.len()));
        }

        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes)?;

        Ok(Kuid { bytes })
    }
}

impl From<[u8; Kuid::BYTES]> for Kuid {
    fn from(bytes: [u8; Kuid::BYTES]) -> Self {
        Kuid::new(bytes)
    }
}
