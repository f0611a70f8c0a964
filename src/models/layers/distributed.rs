use crate::core::error::CoreError;
use candle_core::{Result, Tensor};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// The collective capability the MoE layer relies on.
///
/// `all_reduce` is a barrier: every rank of the group must call it once per
/// reduction, in the same order. A rank that never arrives hangs the others.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Element-wise sum over all ranks; every rank receives the same result.
    fn all_reduce(&self, xs: &Tensor) -> Result<Tensor>;
}

/// Single-rank group.
#[derive(Debug, Default, Clone, Copy)]
pub struct Comm {}

impl Collective for Comm {
    fn rank(&self) -> usize {
        0
    }
    fn world_size(&self) -> usize {
        1
    }
    fn all_reduce(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.clone())
    }
}

struct GroupState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Tensor>>,
    result: Option<std::result::Result<Tensor, String>>,
}

struct LocalGroup {
    world_size: usize,
    state: Mutex<GroupState>,
    cvar: Condvar,
}

/// Ranks of one process, one per thread, reducing through shared memory.
///
/// Contributions are summed in rank order so every run over the same partition
/// produces bit-identical results.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    group: Arc<LocalGroup>,
}

impl LocalComm {
    pub fn group(world_size: usize) -> Result<Vec<LocalComm>> {
        if world_size == 0 {
            return Err(CoreError::InvalidConfig("world_size must be > 0".to_string()).into());
        }
        let group = Arc::new(LocalGroup {
            world_size,
            state: Mutex::new(GroupState {
                generation: 0,
                arrived: 0,
                slots: vec![None; world_size],
                result: None,
            }),
            cvar: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| LocalComm {
                rank,
                group: group.clone(),
            })
            .collect())
    }
}

fn sum_in_rank_order(slots: &mut [Option<Tensor>]) -> std::result::Result<Tensor, String> {
    let mut acc: Option<Tensor> = None;
    for (rank, slot) in slots.iter_mut().enumerate() {
        let xs = slot
            .take()
            .ok_or_else(|| format!("rank {rank} did not contribute"))?;
        acc = Some(match acc {
            None => xs,
            Some(acc) => (acc + xs).map_err(|e| e.to_string())?,
        });
    }
    acc.ok_or_else(|| "empty group".to_string())
}

impl Collective for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce(&self, xs: &Tensor) -> Result<Tensor> {
        let group = &self.group;
        let mut state = group.state.lock();
        let generation = state.generation;
        state.slots[self.rank] = Some(xs.clone());
        state.arrived += 1;
        if state.arrived == group.world_size {
            let reduced = sum_in_rank_order(&mut state.slots);
            state.result = Some(reduced);
            state.arrived = 0;
            state.generation += 1;
            group.cvar.notify_all();
        } else {
            while state.generation == generation {
                group.cvar.wait(&mut state);
            }
        }
        // The next round cannot complete before this rank contributes again, so the
        // stored result still belongs to `generation` here.
        match &state.result {
            Some(Ok(ys)) => Ok(ys.clone()),
            Some(Err(e)) => candle_core::bail!("all_reduce failed: {e}"),
            None => candle_core::bail!("all_reduce finished without a result"),
        }
    }
}

pub struct AllReduce {
    comm: Arc<dyn Collective>,
}

impl AllReduce {
    pub fn new(comm: Arc<dyn Collective>) -> Self {
        Self { comm }
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        if self.comm.world_size() > 1 {
            self.comm.all_reduce(xs)
        } else {
            Ok(xs.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_single_rank_is_identity() {
        let xs = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let ar = AllReduce::new(Arc::new(Comm::default()));
        assert_eq!(ar.apply(&xs).unwrap().to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);
    }

    #[test]
    fn test_local_group_sums_every_round() {
        let comms = LocalComm::group(3).unwrap();
        let results: Vec<Vec<Vec<f32>>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        (0..4)
                            .map(|round| {
                                let v = (comm.rank() + 1) as f32 * 10f32.powi(round);
                                let xs = Tensor::new(&[v, -v], &Device::Cpu).unwrap();
                                comm.all_reduce(&xs).unwrap().to_vec1::<f32>().unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for per_rank in &results {
            for (round, ys) in per_rank.iter().enumerate() {
                let expected = 6f32 * 10f32.powi(round as i32);
                assert_eq!(ys, &vec![expected, -expected]);
            }
        }
    }

    #[test]
    fn test_shape_mismatch_reported_on_every_rank() {
        let comms = LocalComm::group(2).unwrap();
        let errors: Vec<bool> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let len = comm.rank() + 1;
                        let xs = Tensor::zeros(len, candle_core::DType::F32, &Device::Cpu).unwrap();
                        comm.all_reduce(&xs).is_err()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(errors, vec![true, true]);
    }
}
