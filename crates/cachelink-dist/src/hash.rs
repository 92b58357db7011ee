//! The twelve selectable hash functions, each mapping arbitrary bytes to a
//! 32-bit unsigned value.
//!
//! `md-5` (RustCrypto) backs the ketama point hash; `crc` backs the two
//! CRC variants. The rest are hand-rolled: they are small, fully specified
//! bit-mixing functions that are this module's actual subject matter, not
//! a reusable ambient concern pulled from a generic hashing crate.

use cachelink_core::HashKind;
use crc::{Crc, CRC_16_XMODEM, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use md5::{Digest, Md5};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32A: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Dispatches to the selected hash function.
pub fn hash(kind: HashKind, data: &[u8]) -> u32 {
    match kind {
        HashKind::OneAtATime => one_at_a_time(data),
        HashKind::Md5 => md5_32(data),
        HashKind::Crc16 => CRC16.checksum(data) as u32,
        HashKind::Crc32 => CRC32.checksum(data),
        HashKind::Crc32a => CRC32A.checksum(data),
        HashKind::Fnv1_64 => fnv1_64(data) as u32,
        HashKind::Fnv1a64 => fnv1a_64(data) as u32,
        HashKind::Fnv1_32 => fnv1_32(data),
        HashKind::Fnv1a32 => fnv1a_32(data),
        HashKind::Hsieh => hsieh(data),
        HashKind::Murmur => murmur2(data, 0),
        HashKind::Jenkins => jenkins(data),
    }
}

/// Bob Jenkins' "one-at-a-time" hash.
pub fn one_at_a_time(data: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &b in data {
        hash = hash.wrapping_add(b as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

/// The full 128-bit MD5 digest of `data`, used by ketama to derive four
/// continuum points per hash step.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Folds an MD5 digest down to a single 32-bit value (little-endian, first
/// four bytes) for use as a generic "md5" hash function choice.
fn md5_32(data: &[u8]) -> u32 {
    let digest = md5_digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Extracts continuum point `k` (0..=3) from a 16-byte MD5 digest, the way
/// libmemcached-compatible ketama does.
pub fn md5_point(digest: &[u8; 16], k: usize) -> u32 {
    let i = k * 4;
    (digest[i] as u32)
        | ((digest[i + 1] as u32) << 8)
        | ((digest[i + 2] as u32) << 16)
        | ((digest[i + 3] as u32) << 24)
}

const FNV_32_PRIME: u32 = 16_777_619;
const FNV_32_OFFSET: u32 = 2_166_136_261;
const FNV_64_PRIME: u64 = 1_099_511_628_211;
const FNV_64_OFFSET: u64 = 14_695_981_039_346_656_037;

pub fn fnv1_32(data: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for &b in data {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= b as u32;
    }
    hash
}

pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

pub fn fnv1_64(data: &[u8]) -> u64 {
    let mut hash = FNV_64_OFFSET;
    for &b in data {
        hash = hash.wrapping_mul(FNV_64_PRIME);
        hash ^= b as u64;
    }
    hash
}

pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_64_OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_64_PRIME);
    }
    hash
}

/// Paul Hsieh's "SuperFastHash".
pub fn hsieh(data: &[u8]) -> u32 {
    let len = data.len();
    if len == 0 {
        return 0;
    }
    let mut hash: u32 = len as u32;
    let rem = len & 3;
    let mut chunks = data[..len - rem].chunks_exact(4);

    for chunk in &mut chunks {
        let lo = u16::from_le_bytes([chunk[0], chunk[1]]) as u32;
        let hi = u16::from_le_bytes([chunk[2], chunk[3]]) as u32;
        hash = hash.wrapping_add(lo);
        let tmp = (hi << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let tail = &data[len - rem..];
    match rem {
        3 => {
            hash = hash.wrapping_add(u16::from_le_bytes([tail[0], tail[1]]) as u32);
            hash ^= hash << 16;
            hash ^= (tail[2] as u32) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(u16::from_le_bytes([tail[0], tail[1]]) as u32);
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(tail[0] as u32);
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);
    hash
}

/// MurmurHash2, 32-bit — the variant memcached-family distributions mean
/// by "murmur" (distinct from the unrelated MurmurHash3 a `murmur3` crate
/// would give you).
pub fn murmur2(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = seed ^ (len as u32);
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);

        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    let mut rem = 0u32;
    for (i, &b) in tail.iter().enumerate() {
        rem |= (b as u32) << (8 * i);
    }
    if !tail.is_empty() {
        h ^= rem;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Jenkins' full one-at-a-time hash with an extra avalanche mixing pass
/// (distinct in character from the simpler `one_at_a_time` above, as the
/// spec lists them as two separate selectable algorithms).
pub fn jenkins(data: &[u8]) -> u32 {
    let mut a: u32 = 0x9e37_79b9;
    let mut b: u32 = 0x9e37_79b9;
    let mut c: u32 = 0xdead_beef;

    let mut chunks = data.chunks_exact(12);
    for chunk in &mut chunks {
        a = a.wrapping_add(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        b = b.wrapping_add(u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]));
        c = c.wrapping_add(u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]));
        jenkins_mix(&mut a, &mut b, &mut c);
    }

    let rem = chunks.remainder();
    c = c.wrapping_add(data.len() as u32);
    let mut buf = [0u8; 12];
    buf[..rem.len()].copy_from_slice(rem);
    a = a.wrapping_add(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]));
    b = b.wrapping_add(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]));
    c = c.wrapping_add(u32::from_le_bytes([buf[8], buf[9], buf[10], 0]) | ((buf[11] as u32) << 24));
    jenkins_mix(&mut a, &mut b, &mut c);

    c
}

fn jenkins_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a ^= *b;
    *a = a.wrapping_sub(b.rotate_left(11));
    *c ^= *a;
    *c = c.wrapping_sub(a.rotate_left(19));
    *b ^= *c;
    *b = b.wrapping_sub(c.rotate_left(14));
    *a ^= *b;
    *a = a.wrapping_sub(b.rotate_left(7));
    *c ^= *a;
    *c = c.wrapping_sub(a.rotate_left(17));
    *b ^= *c;
    *b = b.wrapping_sub(c.rotate_left(9));
}
