//! ## The built-in payload generator
//! Payloads are produced by a small markov chain. All probabilities are constants below.
//! - S0: Initial State: pick the mode's starting point
//! - SelectFromPool: take a payload that showed new behaviour before and go to MUTATION
//! - Seed: take a well-formed message of the protocol and go to ADDING
//! - ADDING: Either append another well-formed message or go to MUTATION
//! - MUTATION: Mutate (inject, delete, swap) the current payload or go to SEND
//! - SEND: Hand the payload out, final state
//!
//! In mutation guided mode S0 prefers the pool, generation guided mode always starts from a seed.
//! Results with new behaviour are fed back into the pool.
mod mutations;

use crate::collaborators::{FeedbackSink, GeneratorContext, GeneratorError, Payload, PayloadGenerator};
use crate::execution::ExecutionResult;
use crate::markov::mutations::{delete, inject, swap, InjectType};
use crate::protocol::ProtocolRegistry;
use crate::target::CampaignTarget;
use async_trait::async_trait;
use rand::distributions::Standard;
use rand::prelude::Distribution;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::*;

const SEL_FROM_POOL: f32 = 0.7;
const PACKET_APPEND_CHANCE: f32 = 0.2;
const SEND_CHANCE: f32 = 0.2;
const BOF_CHANCE: f32 = 0.2;
pub const MAX_PACKETS: usize = 10;
pub const MAX_PAYLOAD_LEN: usize = 4096;
const MAX_POOL_PER_PROTOCOL: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum State {
    #[default]
    S0,
    SelectFromPool,
    Seed,
    ADDING,
    MUTATION,
    Mutate(Mutations),
    SEND,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mutations {
    // Inserts bytes into the payload
    Inject(InjectType),
    // Deletes bytes from the payload
    Delete,
    // Changes bytes in the payload
    Swap,
}

impl Distribution<Mutations> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Mutations {
        match rng.gen_range(0..3) {
            0 => Mutations::Inject(rng.gen()),
            1 => Mutations::Delete,
            _ => Mutations::Swap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum Mode {
    MutationGuided,
    GenerationGuided,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::MutationGuided => write!(f, "Mutation Guided"),
            Mode::GenerationGuided => write!(f, "Generation Guided"),
        }
    }
}

impl Distribution<Mode> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Mode {
        if rng.gen_range(0..10) < 5 {
            Mode::MutationGuided
        } else {
            Mode::GenerationGuided
        }
    }
}

/// Payloads per protocol, hex encoded on disk:
/// ```toml
/// [seeds]
/// modbus = ["0300000001", "0600010003"]
/// ```
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPool {
    #[serde_as(as = "BTreeMap<_, Vec<Hex>>")]
    #[serde(default)]
    seeds: BTreeMap<String, Vec<Vec<u8>>>,
}

impl SeedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read_from_file(path: impl AsRef<Path>) -> color_eyre::Result<Self> {
        let mut content = String::new();
        File::open(path).await?.read_to_string(&mut content).await?;
        let pool = toml::from_str(&content)?;
        Ok(pool)
    }

    /// Returns false if the payload is already known or the protocol's pool is full.
    pub fn add(&mut self, protocol: &str, payload: &[u8]) -> bool {
        let seeds = self.seeds.entry(protocol.to_string()).or_default();
        if seeds.len() >= MAX_POOL_PER_PROTOCOL || seeds.iter().any(|s| s == payload) {
            return false;
        }
        seeds.push(payload.to_vec());
        true
    }

    pub fn seeds(&self, protocol: &str) -> &[Vec<u8>] {
        self.seeds.get(protocol).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.seeds.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct MutationGenerator {
    registry: Arc<ProtocolRegistry>,
    pool: RwLock<SeedPool>,
    rng: Mutex<Xoshiro256PlusPlus>,
    /// Payloads handed out per target
    iterations: u64,
}

impl MutationGenerator {
    pub fn new(registry: Arc<ProtocolRegistry>, pool: SeedPool, seed: u64, iterations: u64) -> Self {
        Self {
            registry,
            pool: RwLock::new(pool),
            rng: Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed)),
            iterations,
        }
    }

    pub fn pool(&self) -> SeedPool {
        self.pool.read().unwrap().clone()
    }

    fn protocol_seeds(&self, protocol: &str) -> Vec<Vec<u8>> {
        self.registry
            .get(protocol)
            .map(|p| p.handler.seeds())
            .unwrap_or_default()
    }

    /// Runs the chain once for `protocol`.
    pub fn generate(&self, protocol: &str) -> Vec<u8> {
        let seeds = self.protocol_seeds(protocol);
        let pool = self.pool.read().unwrap();
        let learned = pool.seeds(protocol);
        let mut rng = self.rng.lock().unwrap();
        let mode: Mode = rng.gen();

        let mut state = State::S0;
        let mut payload = Vec::new();
        let mut messages = 0;
        loop {
            state = match state {
                State::S0 => match mode {
                    Mode::MutationGuided
                        if !learned.is_empty() && rng.gen_range(0f32..1f32) < SEL_FROM_POOL =>
                    {
                        State::SelectFromPool
                    }
                    _ if seeds.is_empty() && !learned.is_empty() => State::SelectFromPool,
                    _ => State::Seed,
                },
                State::SelectFromPool => {
                    payload = learned[rng.gen_range(0..learned.len())].clone();
                    State::MUTATION
                }
                State::Seed => {
                    match seeds.get(rng.gen_range(0..seeds.len().max(1))) {
                        Some(seed) => payload.extend_from_slice(seed),
                        None => payload.push(rng.gen()),
                    }
                    messages += 1;
                    State::ADDING
                }
                State::ADDING => {
                    if messages < MAX_PACKETS && rng.gen_range(0f32..1f32) < PACKET_APPEND_CHANCE {
                        State::Seed
                    } else {
                        State::MUTATION
                    }
                }
                State::MUTATION => {
                    if rng.gen_range(0f32..1f32) < SEND_CHANCE {
                        State::SEND
                    } else {
                        State::Mutate(rng.gen())
                    }
                }
                State::Mutate(mutation) => {
                    match &mutation {
                        Mutations::Inject(t) => inject(&mut payload, &mut *rng, t),
                        Mutations::Delete => delete(&mut payload, &mut *rng),
                        Mutations::Swap => swap(&mut payload, &mut *rng),
                    }
                    payload.truncate(MAX_PAYLOAD_LEN);
                    State::MUTATION
                }
                State::SEND => break,
            };
            trace!("State: {:?}", state);
        }
        payload
    }
}

#[async_trait]
impl PayloadGenerator for MutationGenerator {
    async fn next_payload(
        &self,
        target: &CampaignTarget,
        ctx: GeneratorContext<'_>,
    ) -> Result<Option<Payload>, GeneratorError> {
        if ctx.issued >= self.iterations {
            return Ok(None);
        }
        Ok(Some(Payload::new(self.generate(&target.protocol))))
    }
}

#[async_trait]
impl FeedbackSink for MutationGenerator {
    async fn feedback(&self, target: &CampaignTarget, payload: &[u8], result: &ExecutionResult) {
        if result.coverage.new_behaviours == 0 || result.is_crash() {
            return;
        }
        if self.pool.write().unwrap().add(&target.protocol, payload) {
            debug!(
                "Request {} showed new behaviour on {}, kept its payload",
                result.request_id, target.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CoverageDelta, ExecutionRequest, Outcome};
    use crate::target::Endpoint;

    fn generator(iterations: u64) -> MutationGenerator {
        MutationGenerator::new(
            Arc::new(ProtocolRegistry::with_builtin()),
            SeedPool::new(),
            42,
            iterations,
        )
    }

    #[test]
    fn seed_pool_reads_hex_toml() {
        let pool: SeedPool = toml::from_str("[seeds]\nmodbus = [\"0300000001\", \"ff\"]\n").unwrap();
        assert_eq!(pool.seeds("modbus"), &[vec![3, 0, 0, 0, 1], vec![0xff]]);
        assert!(pool.seeds("coap").is_empty());
        let empty: SeedPool = toml::from_str("").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn pool_ignores_duplicates() {
        let mut pool = SeedPool::new();
        assert!(pool.add("mqtt", &[1, 2]));
        assert!(!pool.add("mqtt", &[1, 2]));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn payloads_are_bounded() {
        let generator = generator(10);
        for _ in 0..200 {
            assert!(generator.generate("mqtt").len() <= MAX_PAYLOAD_LEN);
        }
        // Unknown protocols have no seeds, the chain starts from a random byte
        for _ in 0..50 {
            assert!(generator.generate("unknown").len() <= MAX_PAYLOAD_LEN);
        }
    }

    #[test]
    fn same_seed_same_payloads() {
        let a = generator(10);
        let b = generator(10);
        for _ in 0..20 {
            assert_eq!(a.generate("modbus"), b.generate("modbus"));
        }
    }

    #[tokio::test]
    async fn stops_after_iterations() {
        let generator = generator(2);
        let target = CampaignTarget::new("plc", "modbus", Endpoint::new("127.0.0.1", 502));
        let ctx = |issued| GeneratorContext {
            campaign_id: "campaign-0001",
            issued,
        };
        assert!(generator.next_payload(&target, ctx(0)).await.unwrap().is_some());
        assert!(generator.next_payload(&target, ctx(1)).await.unwrap().is_some());
        assert!(generator.next_payload(&target, ctx(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_behaviour_feeds_the_pool() {
        let generator = generator(1);
        let target = CampaignTarget::new("plc", "modbus", Endpoint::new("127.0.0.1", 502));
        let request = ExecutionRequest::new(1, target.clone(), vec![9, 9]);
        let mut result = ExecutionResult::new(&request, Outcome::Success);
        generator.feedback(&target, &request.payload, &result).await;
        assert!(generator.pool().is_empty());
        result.coverage = CoverageDelta { new_behaviours: 1 };
        generator.feedback(&target, &request.payload, &result).await;
        assert_eq!(generator.pool().seeds("modbus"), &[vec![9, 9]]);
    }
}
