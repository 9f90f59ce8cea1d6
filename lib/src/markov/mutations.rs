use rand::distributions::Standard;
use rand::prelude::Distribution;
use rand::Rng;

pub fn inject<R: Rng + ?Sized>(payload: &mut Vec<u8>, rng: &mut R, inject_type: &InjectType) {
    match inject_type {
        InjectType::Single => inject_single(payload, rng),
        InjectType::BOF => inject_bof(payload, rng),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InjectType {
    Single,
    /// A run of random bytes at least as long as the payload itself
    BOF,
}

impl Distribution<InjectType> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> InjectType {
        if rng.gen_range(0f32..1f32) < super::BOF_CHANCE {
            InjectType::BOF
        } else {
            InjectType::Single
        }
    }
}

fn inject_bof<R: Rng + ?Sized>(payload: &mut Vec<u8>, rng: &mut R) {
    let idx = rng.gen_range(0..=payload.len());
    let floor = payload.len().max(1);
    let byte_length = rng.gen_range(floor..=floor * 2);
    let mut bytes = vec![0; byte_length];
    rng.fill(&mut bytes[..]);
    payload.splice(idx..idx, bytes);
}

fn inject_single<R: Rng + ?Sized>(payload: &mut Vec<u8>, rng: &mut R) {
    let idx = rng.gen_range(0..=payload.len());
    payload.insert(idx, rng.gen());
}

/// Removes one byte. Empty payloads stay empty.
pub fn delete<R: Rng + ?Sized>(payload: &mut Vec<u8>, rng: &mut R) {
    if payload.is_empty() {
        return;
    }
    let idx = rng.gen_range(0..payload.len());
    payload.remove(idx);
}

/// Overwrites one byte with a random one.
pub fn swap<R: Rng + ?Sized>(payload: &mut [u8], rng: &mut R) {
    if payload.is_empty() {
        return;
    }
    let idx = rng.gen_range(0..payload.len());
    payload[idx] = rng.gen();
}
