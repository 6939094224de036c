//! Starting points for a batch: random, warm start, or an estimated guess.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use rc_types::{InitGuess, IterationSeed, RcError, RcResult, RecConfig};

/// Produces an initial guess directory for a data set ahead of phasing.
pub trait GuessEstimator: Send + Sync {
    /// Returns the directory holding the guess, or `None` when the estimator
    /// could not produce one.
    fn estimate(&self, datafile: &Path, work_dir: &Path) -> RcResult<Option<PathBuf>>;
}

/// Resolve the guess for `datafile`, failing the run when none is produced.
pub fn resolve_guess(
    estimator: &dyn GuessEstimator,
    datafile: &Path,
    work_dir: &Path,
) -> RcResult<PathBuf> {
    match estimator.estimate(datafile, work_dir)? {
        Some(dir) => {
            info!(datafile = ?datafile, guess = ?dir, "Initial guess estimated");
            Ok(dir)
        }
        None => Err(RcError::InitialGuess(format!(
            "no guess produced for {}",
            datafile.display()
        ))),
    }
}

/// Result directories under `continue_dir`, sorted by name. A directory
/// without subdirectories is itself the single previous result.
pub fn continue_dirs(continue_dir: &Path) -> RcResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(continue_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    if dirs.is_empty() {
        dirs.push(continue_dir.to_path_buf());
    }
    Ok(dirs)
}

/// Seeds for the `n` members of a batch.
///
/// With `continue`, previous results are handed out in order and reused
/// cyclically when there are fewer than `n`. With an estimated guess, member
/// 0 starts from it and the rest start randomly.
pub fn initial_seeds(
    config: &RecConfig,
    n: usize,
    guess: Option<&Path>,
) -> RcResult<Vec<IterationSeed>> {
    let mut seeds = vec![IterationSeed::random(); n];
    match config.init_guess {
        InitGuess::Random => {}
        InitGuess::Continue => {
            let continue_dir = config.continue_dir.as_deref().ok_or_else(|| {
                rc_types::config_error!("init_guess 'continue' requires continue_dir")
            })?;
            let dirs = continue_dirs(continue_dir)?;
            for (i, seed) in seeds.iter_mut().enumerate() {
                *seed = IterationSeed::continue_from(&dirs[i % dirs.len()]);
            }
            debug!(members = n, previous = dirs.len(), "Warm start from previous results");
        }
        InitGuess::AiGuess => {
            let guess = guess.ok_or_else(|| {
                RcError::InitialGuess("estimated guess was not resolved".to_string())
            })?;
            if let Some(first) = seeds.first_mut() {
                *first = IterationSeed::continue_from(guess);
            }
        }
    }
    Ok(seeds)
}
