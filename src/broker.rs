//! Fetch frontend: the broker contract a pipeline simulator consumes, plus
//! the configuration and plugin surface used to stand a broker up.

use std::net::{SocketAddr, TcpListener};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cache::{TbCache, TranslatedCode};
use crate::decoder::CapstoneDecoder;
use crate::metadata::{InstKey, MetadataExchanger, LSUNIT_MEM_ACCESS};
use crate::queue::{SliceQueue, TbSlice};
use crate::regions::BinaryRegions;
use crate::server::{Ingest, Receiver};
use crate::{BrokerError, Decoder};

/// Broker capability bits reported by [`Broker::features`].
pub mod feature {
    /// Per-instruction metadata (memory accesses) is published
    pub const METADATA: u32 = 1 << 0;
    /// Region boundaries are reported through `fetch_region`
    pub const REGION: u32 = 1 << 1;
}

/// Whether the last fetched instruction closes a region, and which one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub is_end: bool,
    pub description: Option<String>,
}

impl RegionDescriptor {
    pub fn not_end() -> Self {
        Self {
            is_end: false,
            description: None,
        }
    }

    pub fn end() -> Self {
        Self {
            is_end: true,
            description: None,
        }
    }
}

/// A decoded instruction handed to the consumer. Holds the block's frozen
/// code, so the instruction stays valid however the cache grows.
#[derive(Debug, Clone)]
pub struct FetchedInst {
    code: Arc<TranslatedCode>,
    idx: usize,
}

impl FetchedInst {
    pub fn inst(&self) -> &crate::Insn {
        &self.code.insts[self.idx]
    }

    /// Identity key for metadata lookups.
    pub fn key(&self) -> InstKey {
        (Arc::as_ptr(&self.code) as usize, self.idx)
    }
}

impl Deref for FetchedInst {
    type Target = crate::Insn;

    fn deref(&self) -> &crate::Insn {
        self.inst()
    }
}

/// The interface a pipeline simulator drives to pull decoded instructions.
///
/// `want` is the desired number of instructions; `-1` means "fill the
/// buffer". The broker writes from index 0 and may return fewer than asked.
/// A count of `-1` means the stream has ended.
pub trait Broker: Send {
    /// Capability bits; see [`feature`].
    fn features(&self) -> u32 {
        feature::METADATA
    }

    /// Fetch up to `want` instructions into `buf`, returning the count or
    /// `-1` at end of stream.
    fn fetch(
        &mut self,
        buf: &mut [Option<FetchedInst>],
        want: i32,
        mde: Option<&mut MetadataExchanger<'_>>,
    ) -> i32;

    /// Like [`Broker::fetch`], additionally reporting whether the last
    /// instruction ends a region. The buffer never straddles a region
    /// boundary.
    fn fetch_region(
        &mut self,
        buf: &mut [Option<FetchedInst>],
        want: i32,
        mde: Option<&mut MetadataExchanger<'_>>,
    ) -> (i32, RegionDescriptor);
}

/// Listen and ingestion configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Connections to serve before ceasing operation; 0 means unbounded
    pub max_connections: u32,
    /// Optional path to a binary-regions manifest
    pub regions_manifest: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9487,
            max_connections: 1,
            regions_manifest: None,
        }
    }
}

/// Parse plugin arguments of the form `-flag=value`.
///
/// Recognized flags: `-host=HOST:PORT`, `-max-accepted-connection=N`,
/// `-binary-regions=PATH`. Unrecognized arguments are ignored so hosts can
/// pass through their own.
pub fn parse_broker_args(args: &[&str]) -> Result<BrokerConfig, BrokerError> {
    let mut config = BrokerConfig::default();
    for arg in args {
        if let Some(value) = arg.strip_prefix("-host=") {
            if let Some((host, port)) = value.rsplit_once(':') {
                config.host = host.to_string();
                config.port = port
                    .parse()
                    .map_err(|_| BrokerError::InvalidArgument(format!("invalid port: {port}")))?;
            }
        } else if let Some(value) = arg.strip_prefix("-max-accepted-connection=") {
            config.max_connections = value
                .trim()
                .parse()
                .map_err(|_| BrokerError::InvalidArgument(format!("invalid number: {value}")))?;
        } else if let Some(value) = arg.strip_prefix("-binary-regions=") {
            config.regions_manifest = Some(PathBuf::from(value));
        }
    }
    Ok(config)
}

/// The trace broker: owns the shared stream state and the receiver thread.
pub struct TraceBroker {
    cache: Arc<TbCache>,
    queue: Arc<SliceQueue>,
    regions: Option<Arc<BinaryRegions>>,
    local_addr: SocketAddr,
    receiver: Option<JoinHandle<()>>,
    /// Trace sequence number counter, one per delivered instruction
    total_traces: u32,
}

impl TraceBroker {
    /// Bind the listen socket and spawn the receiver thread.
    ///
    /// A manifest that fails to load is logged and ignored; a bind failure
    /// is fatal to broker construction.
    pub fn new(config: BrokerConfig, decoder: Box<dyn Decoder>) -> Result<Self, BrokerError> {
        let regions = match &config.regions_manifest {
            Some(path) => match BinaryRegions::from_file(path) {
                Ok(regions) => Some(Arc::new(regions)),
                Err(e) => {
                    log::error!("Failed to load binary regions manifest: {}", e);
                    None
                }
            },
            None => None,
        };

        let listener =
            TcpListener::bind((config.host.as_str(), config.port)).map_err(BrokerError::Bind)?;
        let local_addr = listener.local_addr().map_err(BrokerError::Bind)?;

        let cache = Arc::new(TbCache::new());
        let queue = Arc::new(SliceQueue::new());
        let ingest = Ingest::new(cache.clone(), queue.clone(), regions.clone(), decoder);
        let receiver = Receiver::new(listener, config.max_connections, ingest);
        let handle = thread::Builder::new()
            .name("mcad-receiver".to_string())
            .spawn(move || receiver.run())?;

        Ok(Self {
            cache,
            queue,
            regions,
            local_addr,
            receiver: Some(handle),
            total_traces: 0,
        })
    }

    /// The bound listen address (useful with an ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Deliver one batch of drained slices into `buf`, publishing memory
    /// accesses as they stream past.
    fn deliver(
        &mut self,
        slices: Vec<TbSlice>,
        buf: &mut [Option<FetchedInst>],
        cap: usize,
        mut mde: Option<&mut MetadataExchanger<'_>>,
    ) -> (usize, Option<String>) {
        let mut count = 0usize;
        let mut region = None;

        for mut slice in slices {
            let Some(code) = self.cache.get(slice.index) else {
                continue;
            };
            let end = code.len().min(slice.end as usize);
            let mut chain = slice.mem_accesses.take().unwrap_or_default();
            let mut next_access = 0usize;

            for idx in slice.begin as usize..end {
                if count == cap {
                    break;
                }
                let fetched = FetchedInst {
                    code: code.clone(),
                    idx,
                };
                self.total_traces = self.total_traces.wrapping_add(1);
                let seq = self.total_traces;

                if next_access < chain.len() && chain[next_access].0 == idx {
                    let (_, access) = chain[next_access];
                    next_access += 1;
                    if let Some(exchanger) = mde.as_mut() {
                        exchanger.index_map.insert(fetched.key(), seq);
                        exchanger
                            .registry
                            .category_mut(LSUNIT_MEM_ACCESS)
                            .insert(seq, access);
                    }
                }

                buf[count] = Some(fetched);
                count += 1;
            }

            if let Some(r) = slice.region.take() {
                region = Some(r.description.clone());
            }
        }
        (count, region)
    }
}

impl Broker for TraceBroker {
    fn features(&self) -> u32 {
        let mut features = feature::METADATA;
        if self.regions.as_ref().is_some_and(|r| !r.is_empty()) {
            features |= feature::REGION;
        }
        features
    }

    fn fetch(
        &mut self,
        buf: &mut [Option<FetchedInst>],
        want: i32,
        mde: Option<&mut MetadataExchanger<'_>>,
    ) -> i32 {
        self.fetch_region(buf, want, mde).0
    }

    fn fetch_region(
        &mut self,
        buf: &mut [Option<FetchedInst>],
        want: i32,
        mde: Option<&mut MetadataExchanger<'_>>,
    ) -> (i32, RegionDescriptor) {
        if want == 0 {
            return (0, RegionDescriptor::not_end());
        }
        let cap = if want < 0 {
            buf.len()
        } else {
            (want as usize).min(buf.len())
        };
        if cap == 0 {
            return (0, RegionDescriptor::not_end());
        }

        let cache = self.cache.clone();
        let (slices, eof) = self.queue.pop_batch(cap, true, |slice| {
            cache
                .get(slice.index)
                .map_or(0, |code| code.len().min(slice.size()))
        });

        if slices.is_empty() {
            return if eof {
                (-1, RegionDescriptor::end())
            } else {
                (0, RegionDescriptor::not_end())
            };
        }

        let (count, region) = self.deliver(slices, buf, cap, mde);
        let descriptor = match region {
            Some(description) => RegionDescriptor {
                is_end: true,
                description: Some(description),
            },
            None => RegionDescriptor::not_end(),
        };
        (count as i32, descriptor)
    }
}

impl Drop for TraceBroker {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.take() {
            log::debug!("Cleaning up receiver thread...");
            let _ = handle.join();
        }
    }
}

/// Version of the plugin entry-point contract.
pub const BROKER_PLUGIN_API_VERSION: u32 = 1;

/// What a broker host learns from a loaded plugin.
pub struct BrokerPluginInfo {
    pub api_version: u32,
    pub name: &'static str,
    pub version: &'static str,
    /// Parses the plugin's own arguments and installs a broker on the facade
    pub register: fn(&[&str], &mut BrokerFacade) -> Result<(), BrokerError>,
}

/// Hands the target description to a registering plugin and carries the
/// constructed broker back to the host.
pub struct BrokerFacade {
    arch: crate::decoder::Architecture,
    broker: Option<Box<dyn Broker>>,
}

impl BrokerFacade {
    pub fn new(arch: crate::decoder::Architecture) -> Self {
        Self { arch, broker: None }
    }

    pub fn architecture(&self) -> crate::decoder::Architecture {
        self.arch
    }

    pub fn set_broker(&mut self, broker: Box<dyn Broker>) {
        self.broker = Some(broker);
    }

    pub fn take_broker(&mut self) -> Option<Box<dyn Broker>> {
        self.broker.take()
    }
}

fn register_broker(args: &[&str], facade: &mut BrokerFacade) -> Result<(), BrokerError> {
    let config = parse_broker_args(args)?;
    let decoder = CapstoneDecoder::for_architecture(facade.architecture())?;
    let broker = TraceBroker::new(config, Box::new(decoder))?;
    facade.set_broker(Box::new(broker));
    Ok(())
}

/// Plugin entry point: the symbol a broker host resolves after loading this
/// library. Fatal registration errors surface as `Err`; hosts conventionally
/// map them to exit code 1.
#[no_mangle]
pub fn mcad_broker_plugin_info() -> BrokerPluginInfo {
    BrokerPluginInfo {
        api_version: BROKER_PLUGIN_API_VERSION,
        name: "trace-broker",
        version: "v0.1",
        register: register_broker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::DecoderError;
    use crate::queue::OPEN_END;
    use crate::{Address, Insn, MemAccess, MAX_INSTRUCTION_SIZE};
    use std::collections::HashMap;
    use crate::metadata::MetadataRegistry;

    struct ByteDecoder;

    impl Decoder for ByteDecoder {
        fn decode(&self, bytes: &[u8], addr: Address) -> Result<(Insn, usize), DecoderError> {
            let mut encoding = [0u8; MAX_INSTRUCTION_SIZE];
            encoding[0] = bytes[0];
            Ok((
                Insn {
                    addr,
                    size: 1,
                    mnemonic: "byte".to_string(),
                    operands: format!("{:#04x}", bytes[0]),
                    bytes: encoding,
                },
                1,
            ))
        }
    }

    /// A broker over hand-seeded stream state, no socket involved.
    fn offline_broker(regions: Option<BinaryRegions>) -> TraceBroker {
        TraceBroker {
            cache: Arc::new(TbCache::new()),
            queue: Arc::new(SliceQueue::new()),
            regions: regions.map(Arc::new),
            local_addr: "127.0.0.1:0".parse().unwrap(),
            receiver: None,
            total_traces: 0,
        }
    }

    fn seed_block(broker: &TraceBroker, index: u32, len: usize, pc: u64) {
        broker
            .cache
            .insert(index, (0..len).map(|i| vec![i as u8]).collect());
        broker
            .cache
            .ensure_translated(index, pc, &mut ByteDecoder)
            .unwrap();
    }

    #[test]
    fn test_fetch_zero() {
        let mut broker = offline_broker(None);
        let mut buf: Vec<Option<FetchedInst>> = vec![None; 4];
        assert_eq!(
            broker.fetch_region(&mut buf, 0, None),
            (0, RegionDescriptor::not_end())
        );
    }

    #[test]
    fn test_split_across_fetch_boundary() {
        let mut broker = offline_broker(None);
        seed_block(&broker, 0, 10, 0x1000);
        broker
            .queue
            .push(TbSlice::new(0, 0, OPEN_END, None, None));
        broker.queue.mark_eof();

        let mut buf: Vec<Option<FetchedInst>> = vec![None; 16];
        let (count, region) = broker.fetch_region(&mut buf, 4, None);
        assert_eq!(count, 4);
        assert!(!region.is_end);
        assert_eq!(buf[0].as_ref().unwrap().addr, 0x1000);
        assert_eq!(buf[3].as_ref().unwrap().addr, 0x1003);

        let (count, _) = broker.fetch_region(&mut buf, 10, None);
        assert_eq!(count, 6);
        assert_eq!(buf[0].as_ref().unwrap().addr, 0x1004);
        assert_eq!(buf[5].as_ref().unwrap().addr, 0x1009);

        assert_eq!(
            broker.fetch_region(&mut buf, 10, None),
            (-1, RegionDescriptor::end())
        );
    }

    #[test]
    fn test_negative_want_fills_buffer() {
        let mut broker = offline_broker(None);
        seed_block(&broker, 0, 6, 0x0);
        broker
            .queue
            .push(TbSlice::new(0, 0, OPEN_END, None, None));

        let mut buf: Vec<Option<FetchedInst>> = vec![None; 4];
        let (count, _) = broker.fetch_region(&mut buf, -1, None);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_every_call_after_eof_ends() {
        let mut broker = offline_broker(None);
        broker.queue.mark_eof();

        let mut buf: Vec<Option<FetchedInst>> = vec![None; 4];
        for _ in 0..3 {
            let (count, region) = broker.fetch_region(&mut buf, 4, None);
            assert_eq!(count, -1);
            assert!(region.is_end);
        }
    }

    #[test]
    fn test_region_descriptor_carries_description() {
        let regions = BinaryRegions::from_text("0x0 0x10 hot loop");
        let mut broker = offline_broker(Some(regions));
        seed_block(&broker, 0, 3, 0x0);

        let region = broker.regions.as_ref().unwrap().lookup(0).unwrap().clone();
        broker
            .queue
            .push(TbSlice::new(0, 0, 3, Some(region), None));

        let mut buf: Vec<Option<FetchedInst>> = vec![None; 8];
        let (count, descriptor) = broker.fetch_region(&mut buf, 8, None);
        assert_eq!(count, 3);
        assert!(descriptor.is_end);
        assert_eq!(descriptor.description.as_deref(), Some("hot loop"));
    }

    #[test]
    fn test_mem_access_published_with_sequence_numbers() {
        let mut broker = offline_broker(None);
        seed_block(&broker, 0, 4, 0x1000);

        let access = MemAccess {
            is_store: true,
            addr: 0x8000,
            size: 8,
        };
        broker.queue.push(TbSlice::new(
            0,
            0,
            OPEN_END,
            None,
            Some(vec![(2, access)]),
        ));

        let mut registry = MetadataRegistry::new();
        let mut index_map = HashMap::new();
        let mut buf: Vec<Option<FetchedInst>> = vec![None; 8];
        let mut exchanger = MetadataExchanger {
            registry: &mut registry,
            index_map: &mut index_map,
        };
        let (count, _) = broker.fetch_region(&mut buf, 8, Some(&mut exchanger));
        assert_eq!(count, 4);

        let seq = index_map[&buf[2].as_ref().unwrap().key()];
        assert_eq!(registry.get(LSUNIT_MEM_ACCESS, seq), Some(&access));
        // Only the instruction with an access got a registry entry.
        assert!(!index_map.contains_key(&buf[0].as_ref().unwrap().key()));
    }

    #[test]
    fn test_features() {
        let broker = offline_broker(None);
        assert_eq!(broker.features(), feature::METADATA);

        let broker = offline_broker(Some(BinaryRegions::from_text("0x0 0x10 L")));
        assert_eq!(broker.features(), feature::METADATA | feature::REGION);

        let broker = offline_broker(Some(BinaryRegions::from_text("")));
        assert_eq!(broker.features(), feature::METADATA);
    }

    #[test]
    fn test_parse_broker_args() {
        let config = parse_broker_args(&[
            "-host=0.0.0.0:1234",
            "-max-accepted-connection=3",
            "-binary-regions=/tmp/regions.txt",
            "-something-else",
        ])
        .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 1234);
        assert_eq!(config.max_connections, 3);
        assert_eq!(
            config.regions_manifest.as_deref(),
            Some(std::path::Path::new("/tmp/regions.txt"))
        );
    }

    #[test]
    fn test_parse_broker_args_defaults() {
        let config = parse_broker_args(&[]).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 9487);
        assert_eq!(config.max_connections, 1);
        assert!(config.regions_manifest.is_none());
    }

    #[test]
    fn test_parse_broker_args_bad_number() {
        assert!(matches!(
            parse_broker_args(&["-max-accepted-connection=lots"]),
            Err(BrokerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_plugin_info() {
        let info = mcad_broker_plugin_info();
        assert_eq!(info.api_version, BROKER_PLUGIN_API_VERSION);
        assert_eq!(info.name, "trace-broker");
    }

    #[test]
    fn test_facade_carries_broker() {
        let mut facade = BrokerFacade::new(crate::decoder::Architecture::X86_64);
        assert!(facade.take_broker().is_none());

        facade.set_broker(Box::new(offline_broker(None)));
        let mut broker = facade.take_broker().unwrap();
        let mut buf: Vec<Option<FetchedInst>> = vec![None; 2];
        assert_eq!(broker.fetch(&mut buf, 0, None), 0);
    }
}
