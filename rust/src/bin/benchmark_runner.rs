use blockcache::cache::{BufferCache, CacheStats};
use blockcache::config::{CacheConfig, PoolConfig};
use blockcache::disk::{CompletionMode, DeviceId, DiskTable, RamDisk};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

const BLOCK_SIZE: usize = 512;
const DEVICE: DeviceId = DeviceId::new(1, 0);

/// Standalone workload runner reporting hit rates and throughput
fn main() {
    println!("Block Cache Workload Benchmark");
    println!("==============================\n");

    let benchmark = WorkloadBenchmark::new();
    let results = benchmark.run_benchmark_suite();

    let report = WorkloadBenchmark::generate_report(results);
    println!("{report}");
}

/// One workload: cache size, disk size and the blocks touched
#[derive(Clone)]
pub struct BenchmarkConfig {
    pub name: &'static str,
    pub buffers: usize,
    pub disk_blocks: u64,
    pub access_pattern: AccessPattern,
    pub workload_type: WorkloadType,
}

#[derive(Clone)]
pub enum AccessPattern {
    Sequential,
    Random(Vec<u64>),
    Working(Vec<u64>), // Simulates working set locality
    LruWorst,          // One block more than the pool holds, cycled
}

#[derive(Clone)]
pub enum WorkloadType {
    ReadOnly,
    WriteHeavy(f64), // Fraction of accesses that modify the block
    Synchronous,     // Every access is a write waited on with sync
}

#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    pub device_name: String,
    pub config_name: String,
    pub buffers: usize,
    pub disk_blocks: u64,
    pub total_operations: usize,
    pub stats: CacheStats,
    pub elapsed_nanos: u128,
}

impl PerformanceMetrics {
    pub fn operations_per_second(&self) -> f64 {
        if self.elapsed_nanos == 0 {
            0.0
        } else {
            (self.total_operations as f64) / (self.elapsed_nanos as f64 / 1_000_000_000.0)
        }
    }

    pub fn avg_latency_nanos(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.elapsed_nanos as f64 / self.total_operations as f64
        }
    }

    pub fn evictions_per_1k_ops(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            (self.stats.evictions as f64 / self.total_operations as f64) * 1000.0
        }
    }
}

/// Linear congruential generator, enough to spread accesses reproducibly
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.state >> 11
    }

    fn next_range(&mut self, min: u64, max: u64) -> u64 {
        min + (self.next_u64() % (max - min))
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / ((1u64 << 53) as f64)
    }
}

pub struct WorkloadBenchmark {
    devices: Vec<(&'static str, CompletionMode)>,
    configs: Vec<BenchmarkConfig>,
}

impl Default for WorkloadBenchmark {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadBenchmark {
    pub fn new() -> Self {
        Self {
            devices: vec![
                ("inline_completion", CompletionMode::Inline),
                ("deferred_completion", CompletionMode::Deferred),
            ],
            configs: Self::create_benchmark_configs(),
        }
    }

    fn random(seed: u64, count: usize, blocks: u64) -> Vec<u64> {
        let mut rng = SimpleRng::new(seed);
        (0..count).map(|_| rng.next_range(0, blocks)).collect()
    }

    fn create_benchmark_configs() -> Vec<BenchmarkConfig> {
        vec![
            BenchmarkConfig {
                name: "small_pool_sequential",
                buffers: 4,
                disk_blocks: 64,
                access_pattern: AccessPattern::Sequential,
                workload_type: WorkloadType::ReadOnly,
            },
            BenchmarkConfig {
                name: "small_pool_random",
                buffers: 4,
                disk_blocks: 64,
                access_pattern: AccessPattern::Random(Self::random(42, 400, 64)),
                workload_type: WorkloadType::ReadOnly,
            },
            BenchmarkConfig {
                name: "working_set_locality",
                buffers: 8,
                disk_blocks: 128,
                access_pattern: AccessPattern::Working(Self::generate_working_set_pattern(128, 8, 1000)),
                workload_type: WorkloadType::ReadOnly,
            },
            BenchmarkConfig {
                name: "write_heavy",
                buffers: 16,
                disk_blocks: 256,
                access_pattern: AccessPattern::Random(Self::random(456, 1000, 256)),
                workload_type: WorkloadType::WriteHeavy(0.4),
            },
            BenchmarkConfig {
                name: "write_heavy_working_set",
                buffers: 16,
                disk_blocks: 256,
                access_pattern: AccessPattern::Working(Self::generate_working_set_pattern(256, 12, 1000)),
                workload_type: WorkloadType::WriteHeavy(0.7),
            },
            BenchmarkConfig {
                name: "synchronous_writes",
                buffers: 8,
                disk_blocks: 64,
                access_pattern: AccessPattern::Random(Self::random(789, 300, 64)),
                workload_type: WorkloadType::Synchronous,
            },
            BenchmarkConfig {
                name: "large_scan",
                buffers: 64,
                disk_blocks: 2048,
                access_pattern: AccessPattern::Sequential,
                workload_type: WorkloadType::ReadOnly,
            },
            BenchmarkConfig {
                name: "lru_worst_case",
                buffers: 4,
                disk_blocks: 16,
                access_pattern: AccessPattern::LruWorst,
                workload_type: WorkloadType::ReadOnly,
            },
            BenchmarkConfig {
                name: "single_buffer",
                buffers: 1,
                disk_blocks: 32,
                access_pattern: AccessPattern::Random(Self::random(999, 300, 32)),
                workload_type: WorkloadType::WriteHeavy(0.2),
            },
        ]
    }

    /// 80% of accesses hit a small hot set, the rest spread over the disk
    fn generate_working_set_pattern(disk_blocks: u64, working_set_size: u64, num_accesses: usize) -> Vec<u64> {
        let mut rng = SimpleRng::new(42);
        (0..num_accesses)
            .map(|_| {
                if rng.next_f64() < 0.8 {
                    rng.next_range(0, working_set_size)
                } else {
                    rng.next_range(working_set_size, disk_blocks)
                }
            })
            .collect()
    }

    fn generate_access_sequence(&self, config: &BenchmarkConfig) -> Vec<u64> {
        match &config.access_pattern {
            AccessPattern::Sequential => (0..config.disk_blocks).cycle().take(config.disk_blocks as usize * 2).collect(),
            AccessPattern::Random(pattern) | AccessPattern::Working(pattern) => pattern.clone(),
            AccessPattern::LruWorst => (0..100).flat_map(|_| 0..=config.buffers as u64).collect(),
        }
    }

    pub fn run_single_benchmark(
        &self,
        device_name: &str,
        mode: CompletionMode,
        config: &BenchmarkConfig,
    ) -> blockcache::Result<PerformanceMetrics> {
        let disks = Arc::new(DiskTable::new());
        disks.register(DEVICE, Arc::new(RamDisk::with_mode(BLOCK_SIZE, config.disk_blocks, mode)))?;
        let cache = BufferCache::init(CacheConfig::new(vec![PoolConfig::new(BLOCK_SIZE, config.buffers)]), disks)?;

        let access_sequence = self.generate_access_sequence(config);
        let mut rng = SimpleRng::new(7);
        let start_time = Instant::now();

        for &block in &access_sequence {
            match &config.workload_type {
                WorkloadType::ReadOnly => {
                    let handle = cache.read(DEVICE, block)?;
                    cache.release(handle)?;
                }
                WorkloadType::WriteHeavy(write_ratio) => {
                    let handle = cache.read(DEVICE, block)?;
                    if rng.next_f64() < *write_ratio {
                        handle.with_data(|data| data[..8].copy_from_slice(&block.to_le_bytes()));
                        cache.release_modified(handle)?;
                    } else {
                        cache.release(handle)?;
                    }
                }
                WorkloadType::Synchronous => {
                    let handle = cache.get(DEVICE, block)?;
                    handle.fill(&block.to_le_bytes());
                    cache.sync(handle)?;
                }
            }
        }
        cache.sync_device(DEVICE)?;

        let elapsed = start_time.elapsed();
        let stats = cache.stats();
        cache.shutdown();

        Ok(PerformanceMetrics {
            device_name: device_name.to_string(),
            config_name: config.name.to_string(),
            buffers: config.buffers,
            disk_blocks: config.disk_blocks,
            total_operations: access_sequence.len(),
            stats,
            elapsed_nanos: elapsed.as_nanos(),
        })
    }

    pub fn run_benchmark_suite(&self) -> Vec<PerformanceMetrics> {
        let mut results = Vec::new();

        println!("Running benchmark suite...\n");

        for (config_idx, config) in self.configs.iter().enumerate() {
            println!("Running config {}/{}: {}", config_idx + 1, self.configs.len(), config.name);

            for (device_name, mode) in &self.devices {
                print!("  Testing {device_name} ... ");
                match self.run_single_benchmark(device_name, *mode, config) {
                    Ok(metrics) => {
                        println!(
                            "Hit rate: {:.1}%, Ops/sec: {:.0}",
                            metrics.stats.hit_rate() * 100.0,
                            metrics.operations_per_second()
                        );
                        results.push(metrics);
                    }
                    Err(e) => println!("failed: {e}"),
                }
            }
            println!();
        }

        results
    }

    pub fn generate_report(results: Vec<PerformanceMetrics>) -> String {
        let mut report = String::new();
        report.push_str("# Block Cache Performance Analysis\n\n");

        let mut by_config: BTreeMap<&str, Vec<&PerformanceMetrics>> = BTreeMap::new();
        for result in &results {
            by_config.entry(result.config_name.as_str()).or_default().push(result);
        }

        for (config_name, config_results) in &by_config {
            let first_result = config_results[0];

            report.push_str(&format!("## {config_name}\n"));
            report.push_str(&format!("- Buffers: {}\n", first_result.buffers));
            report.push_str(&format!("- Disk blocks: {}\n", first_result.disk_blocks));
            report.push_str(&format!("- Operations: {}\n\n", first_result.total_operations));

            report.push_str("| Device | Hit Rate | Ops/sec | Avg Latency (ns) | Evictions/1k ops | Reads | Writes |\n");
            report.push_str("|--------|----------|---------|------------------|------------------|-------|--------|\n");

            for result in config_results {
                report.push_str(&format!(
                    "| {} | {:.1}% | {:.0} | {:.1} | {:.1} | {} | {} |\n",
                    result.device_name,
                    result.stats.hit_rate() * 100.0,
                    result.operations_per_second(),
                    result.avg_latency_nanos(),
                    result.evictions_per_1k_ops(),
                    result.stats.reads,
                    result.stats.writes
                ));
            }
            report.push('\n');
        }

        report.push_str("## Summary Analysis\n\n");

        let mut device_totals: BTreeMap<&str, (f64, f64, usize)> = BTreeMap::new();
        for result in &results {
            let entry = device_totals.entry(result.device_name.as_str()).or_insert((0.0, 0.0, 0));
            entry.0 += result.stats.hit_rate();
            entry.1 += result.operations_per_second();
            entry.2 += 1;
        }

        report.push_str("### Average Performance by Completion Mode\n\n");
        report.push_str("| Device | Avg Hit Rate | Avg Ops/sec |\n");
        report.push_str("|--------|--------------|-------------|\n");

        for (device, (hit_rate_sum, ops_sum, count)) in device_totals {
            report.push_str(&format!(
                "| {} | {:.1}% | {:.0} |\n",
                device,
                (hit_rate_sum / count as f64) * 100.0,
                ops_sum / count as f64
            ));
        }

        report
    }
}
