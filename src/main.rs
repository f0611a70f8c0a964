use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::Parser;
use paged_ep::core::device_policy::DevicePolicyKind;
use paged_ep::core::runner::StepRunner;
use paged_ep::core::sequence::SequenceMeta;
use paged_ep::core::step_context::RopeParams;
use paged_ep::models::layers::distributed::{Collective, Comm, LocalComm};
use paged_ep::models::layers::expert_partition::ExpertPartition;
use paged_ep::models::layers::moe::ExpertParallelMoe;
use paged_ep::utils::config::{EngineConfig, MoEConfig};
use paged_ep::utils::{get_kvcache_blocks, new_device};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON engine config; command line flags override its fields
    #[arg(long)]
    config: Option<String>,

    /// Size of a cache block (tokens)
    #[arg(long)]
    block_size: Option<usize>,

    #[arg(long)]
    num_blocks: Option<usize>,

    /// Memory for the kv cache (MB), overrides num_blocks
    #[arg(long = "kvmem")]
    kvcache_mem: Option<usize>,

    /// dense_mask or kernel_mask
    #[arg(long)]
    policy: Option<DevicePolicyKind>,

    /// Number of in-process expert-parallel ranks
    #[arg(long)]
    world_size: Option<usize>,

    #[arg(long)]
    num_experts: Option<usize>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long, default_value_t = false)]
    renormalize: bool,

    /// Prompt lengths of the synthetic requests
    #[arg(long, value_delimiter = ',', default_value = "7,12,3")]
    prompts: Vec<usize>,

    #[arg(long, default_value_t = 4)]
    decode_steps: usize,

    #[arg(long)]
    dtype: Option<String>,

    #[arg(long, default_value_t = false)]
    cpu: bool,

    #[arg(long, default_value_t = 0)]
    device_id: usize,

    #[arg(long)]
    seed: Option<u64>,
}

fn engine_config(args: &Args) -> Result<EngineConfig> {
    let mut cfg = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    apply_overrides(&mut cfg, args);
    cfg.validate()?;
    Ok(cfg)
}

fn apply_overrides(cfg: &mut EngineConfig, args: &Args) {
    if let Some(block_size) = args.block_size {
        cfg.cache.block_size = block_size;
    }
    if let Some(num_blocks) = args.num_blocks {
        cfg.cache.num_blocks = num_blocks;
    }
    if let Some(policy) = args.policy {
        cfg.cache.device_policy = policy;
    }
    if let Some(world_size) = args.world_size {
        // every rank of the group runs in this process; the file's rank no longer applies
        cfg.parallel.world_size = world_size;
        cfg.parallel.rank = 0;
    }
    if let Some(num_experts) = args.num_experts {
        cfg.moe.n_routed_experts = num_experts;
    }
    if let Some(top_k) = args.top_k {
        cfg.moe.num_experts_per_tok = top_k;
    }
    if args.renormalize {
        cfg.moe.renormalize = true;
    }
    if args.seed.is_some() {
        cfg.seed = args.seed;
    }
}

/// Lays requests out in disjoint, deliberately scattered blocks.
fn allocate_tables(lens: &[usize], block_size: usize, num_blocks: usize) -> Result<Vec<Vec<u32>>> {
    let needed: Vec<usize> = lens.iter().map(|l| l.div_ceil(block_size)).collect();
    let total: usize = needed.iter().sum();
    if total > num_blocks {
        anyhow::bail!("{total} blocks needed, cache holds {num_blocks}");
    }
    // hand out blocks from the back of the pool, interleaving requests
    let mut free: Vec<u32> = (0..num_blocks as u32).collect();
    let mut tables = vec![Vec::new(); lens.len()];
    let mut pending = true;
    while pending {
        pending = false;
        for (table, &n) in tables.iter_mut().zip(needed.iter()) {
            if table.len() < n {
                if let Some(block) = free.pop() {
                    table.push(block);
                }
                pending |= table.len() < n;
            }
        }
    }
    Ok(tables)
}

fn run_attention_steps(cfg: &EngineConfig, args: &Args, dtype: DType, device: &Device) -> Result<()> {
    let mut runner = StepRunner::new(&cfg.cache, &cfg.attention, dtype, device)?;
    let total_lens: Vec<usize> = args.prompts.iter().map(|p| p + args.decode_steps).collect();
    let tables = allocate_tables(&total_lens, cfg.cache.block_size, cfg.cache.num_blocks)?;
    let heads = cfg.attention.num_attention_heads;
    let kv_heads = cfg.attention.num_key_value_heads;
    let head_dim = cfg.attention.head_dim;
    let rope = RopeParams {
        head_dim,
        theta: cfg.attention.rope_theta,
    };

    let mut history = vec![0usize; args.prompts.len()];
    for step in 0..=args.decode_steps {
        let seqs: Vec<SequenceMeta> = history
            .iter()
            .zip(args.prompts.iter())
            .zip(tables.iter())
            .map(|((&h, &p), table)| {
                let query_len = if step == 0 { p } else { 1 };
                SequenceMeta::new(h, query_len, table.clone())
            })
            .collect();
        let num_tokens: usize = seqs.iter().map(|s| s.query_len).sum();
        let q = Tensor::randn(0f32, 1.0, (num_tokens, heads, head_dim), device)?.to_dtype(dtype)?;
        let k = Tensor::randn(0f32, 1.0, (num_tokens, kv_heads, head_dim), device)?.to_dtype(dtype)?;
        let v = Tensor::randn(0f32, 1.0, (num_tokens, kv_heads, head_dim), device)?.to_dtype(dtype)?;

        let ctx = runner.build_context(&seqs)?;
        let (cos, _) = ctx.rotary_cos_sin(rope)?;
        let out = runner.run(&seqs, &q, &k, &v)?;
        tracing::info!(
            "step {step}: {} tokens, decoding {}, unpaged prefill {}, max_kv {}, rotary {:?}, out {:?}",
            num_tokens,
            ctx.is_decoding,
            ctx.is_unpaged_prefill,
            ctx.max_kv_seq_len,
            cos.dims(),
            out.dims()
        );
        for (h, s) in history.iter_mut().zip(seqs.iter()) {
            *h += s.query_len;
        }
    }
    Ok(())
}

fn synthetic_moe_weights(cfg: &MoEConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let (hidden, ffn) = (cfg.hidden_size, cfg.moe_intermediate_size);
    let mut ts = HashMap::new();
    ts.insert(
        "gate.weight".to_string(),
        Tensor::randn(0f32, 1.0, (cfg.n_routed_experts, hidden), device)?,
    );
    for e in 0..cfg.n_routed_experts {
        for (name, shape) in [
            ("gate_proj", (ffn, hidden)),
            ("up_proj", (ffn, hidden)),
            ("down_proj", (hidden, ffn)),
        ] {
            ts.insert(
                format!("experts.{e}.{name}.weight"),
                Tensor::randn(0f32, 0.1, shape, device)?,
            );
        }
    }
    if let Some(n) = cfg.n_shared_experts.filter(|&n| n > 0) {
        for (name, shape) in [
            ("gate_proj", (ffn * n, hidden)),
            ("up_proj", (ffn * n, hidden)),
            ("down_proj", (hidden, ffn * n)),
        ] {
            ts.insert(
                format!("shared_experts.{name}.weight"),
                Tensor::randn(0f32, 0.1, shape, device)?,
            );
        }
    }
    Ok(ts)
}

fn run_moe(cfg: &EngineConfig, dtype: DType, device: &Device) -> Result<()> {
    let weights = synthetic_moe_weights(&cfg.moe, device)?;
    let xs = Tensor::randn(0f32, 1.0, (16, cfg.moe.hidden_size), device)?.to_dtype(dtype)?;

    let single = {
        let vb = VarBuilder::from_tensors(weights.clone(), dtype, device);
        let comm: Arc<dyn Collective> = Arc::new(Comm::default());
        ExpertParallelMoe::new(&cfg.moe, vb, comm, dtype)?.forward(&xs)?
    };

    let world_size = cfg.parallel.world_size;
    // A rank failing before the reduction would leave the others waiting on it.
    for rank in 0..world_size {
        ExpertPartition::new(cfg.moe.n_routed_experts, world_size, rank)?;
    }
    let comms = LocalComm::group(world_size)?;
    let outputs: Vec<Tensor> = std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let weights = weights.clone();
                let xs = &xs;
                s.spawn(move || -> candle_core::Result<Tensor> {
                    let vb = VarBuilder::from_tensors(weights, dtype, device);
                    let moe = ExpertParallelMoe::new(&cfg.moe, vb, Arc::new(comm), dtype)?;
                    moe.forward(xs)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("rank thread panicked"))?
                    .map_err(anyhow::Error::from)
            })
            .collect::<Result<Vec<_>>>()
    })?;

    for (rank, ys) in outputs.iter().enumerate() {
        let diff = (ys.to_dtype(DType::F32)? - single.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        tracing::info!(
            "rank {rank}/{world_size}: output {:?}, max |distributed - single| = {diff:e}",
            ys.dims()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    let mut cfg = engine_config(&args)?;

    let dtype = match args.dtype.as_deref() {
        Some("f16") => DType::F16,
        Some("bf16") => DType::BF16,
        Some("f32") | None => DType::F32,
        Some(dtype) => anyhow::bail!("Unsupported dtype {dtype}"),
    };
    let device = if args.cpu {
        Device::Cpu
    } else {
        new_device(args.device_id)?
    };
    if let Some(seed) = cfg.seed {
        device.set_seed(seed)?;
    }
    if let Some(mem) = args.kvcache_mem {
        cfg.cache.num_blocks = get_kvcache_blocks(mem, cfg.cache.block_size, &cfg.attention, dtype);
        cfg.validate()?;
    }
    tracing::info!("{:?}", cfg);

    run_attention_steps(&cfg, &args, dtype, &device)?;
    run_moe(&cfg, dtype, &device)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paged_ep::utils::config::ParallelConfig;

    #[test]
    fn test_world_size_override_resets_rank() {
        let mut cfg = EngineConfig {
            parallel: ParallelConfig {
                rank: 1,
                world_size: 2,
            },
            ..EngineConfig::default()
        };
        let args = Args::parse_from(["paged-ep", "--world-size", "1", "--top-k", "1"]);
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.parallel.rank, 0);
        assert_eq!(cfg.parallel.world_size, 1);
        assert_eq!(cfg.moe.num_experts_per_tok, 1);
        cfg.validate().unwrap();

        let mut kept = EngineConfig {
            parallel: ParallelConfig {
                rank: 1,
                world_size: 2,
            },
            ..EngineConfig::default()
        };
        apply_overrides(&mut kept, &Args::parse_from(["paged-ep"]));
        assert_eq!(kept.parallel.rank, 1);
    }
}
