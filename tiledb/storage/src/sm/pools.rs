//! The two worker pools of the storage manager: compute (tile
//! preparation, filtering, sorting) and I/O (disk reads and writes).

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::Config;
use crate::error::{Error, Result};

pub struct Pools {
    compute: ThreadPool,
    io: ThreadPool,
}

impl Pools {
    pub fn new(config: &Config) -> Result<Self> {
        let build = |name: &'static str, threads: usize| {
            ThreadPoolBuilder::new()
                .num_threads(threads.max(1))
                .thread_name(move |i| format!("tiledb-{name}-{i}"))
                .build()
                .map_err(|e| {
                    Error::Unsupported(format!(
                        "cannot spawn {name} pool: {e}"
                    ))
                })
        };
        Ok(Pools {
            compute: build("compute", config.compute_concurrency_level)?,
            io: build("io", config.io_concurrency_level)?,
        })
    }

    pub fn compute(&self) -> &ThreadPool {
        &self.compute
    }

    pub fn io(&self) -> &ThreadPool {
        &self.io
    }
}

impl std::fmt::Debug for Pools {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pools")
            .field("compute_threads", &self.compute.current_num_threads())
            .field("io_threads", &self.io.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_by_config() {
        let config = Config {
            compute_concurrency_level: 2,
            io_concurrency_level: 3,
            ..Config::default()
        };
        let pools = Pools::new(&config).unwrap();
        assert_eq!(2, pools.compute().current_num_threads());
        assert_eq!(3, pools.io().current_num_threads());
    }
}
