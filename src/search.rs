//! Adaptive search for the largest context that fits
//!
//! Each probe of the oracle costs a full model load, so the search is shaped to
//! minimize probes: test the declared maximum first, halve until something fits,
//! then bisect the remaining gap down to a resolution. The oracle is any async
//! predicate; nothing here knows about the daemon.

use serde::Serialize;
use std::future::Future;

/// Search space and stopping rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBounds {
    /// Smallest context worth reporting; assumed to fit if the model fits at all
    pub min: u32,
    /// Declared maximum context of the model
    pub max: u32,
    /// Bisection stops once the open interval is no wider than this
    pub resolution: u32,
    /// Cap on bisection probes (the initial and halving probes are not counted)
    pub max_iterations: u32,
}

impl SearchBounds {
    /// Lower bound actually used: `min` clamped to the declared maximum
    pub fn floor(&self) -> u32 {
        self.min.clamp(1, self.max.max(1))
    }
}

/// Result of one oracle probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trial<T> {
    pub context: u32,
    pub fits: bool,
    pub detail: T,
    /// The oracle cannot continue after this trial
    pub abandon: bool,
}

impl<T> Trial<T> {
    pub fn fits(context: u32, detail: T) -> Self {
        Self {
            context,
            fits: true,
            detail,
            abandon: false,
        }
    }

    pub fn does_not_fit(context: u32, detail: T) -> Self {
        Self {
            context,
            fits: false,
            detail,
            abandon: false,
        }
    }

    /// Keep this trial but end the search after it
    pub fn abandoning(mut self) -> Self {
        self.abandon = true;
        self
    }
}

/// How the search phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Declared maximum fit on the first probe
    DeclaredMaxFits,
    /// Bracket narrowed to the resolution
    Converged,
    /// Bisection probe cap reached before convergence
    IterationCap,
    /// Even the floor did not fit
    NothingFits,
    /// The oracle gave up; `best` is the largest fit seen before that
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome<T> {
    /// Index into `trials` of the largest fitting probe
    best: Option<usize>,
    pub trials: Vec<Trial<T>>,
    pub termination: Termination,
}

impl<T> SearchOutcome<T> {
    /// Largest context that fit, with its observation
    pub fn best(&self) -> Option<&Trial<T>> {
        self.best.map(|i| &self.trials[i])
    }

    /// Number of oracle probes, i.e. load cycles
    pub fn probes(&self) -> usize {
        self.trials.len()
    }
}

struct Recorder<T> {
    trials: Vec<Trial<T>>,
    best: Option<usize>,
    abandoned: bool,
}

impl<T> Recorder<T> {
    fn push(&mut self, trial: Trial<T>) -> bool {
        let fits = trial.fits;
        self.abandoned |= trial.abandon;
        self.trials.push(trial);
        if fits {
            self.best = Some(self.trials.len() - 1);
        }
        fits
    }

    fn finish(self, termination: Termination) -> SearchOutcome<T> {
        SearchOutcome {
            best: self.best,
            trials: self.trials,
            termination,
        }
    }
}

/// Find the largest context in `[bounds.floor(), bounds.max]` accepted by `probe`
///
/// `probe` is called strictly sequentially. An `Err` aborts the search and is
/// returned as-is; callers decide which conditions count as "does not fit".
/// A trial marked [`Trial::abandoning`] is recorded, then the search stops with
/// [`Termination::Abandoned`] and whatever fit so far.
pub async fn find_max_fit<T, E, F, Fut>(
    bounds: SearchBounds,
    mut probe: F,
) -> Result<SearchOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Trial<T>, E>>,
{
    let lo_floor = bounds.floor();
    let mut rec = Recorder {
        trials: Vec::new(),
        best: None,
        abandoned: false,
    };

    // Bound-finding phase: declared max first, then halve toward the floor
    let mut candidate = bounds.max.max(lo_floor);
    let mut known_bad = candidate;
    let mut lo = loop {
        let fits = rec.push(probe(candidate).await?);
        if rec.abandoned {
            return Ok(rec.finish(Termination::Abandoned));
        }
        if fits {
            break candidate;
        }
        known_bad = candidate;
        if candidate <= lo_floor {
            return Ok(rec.finish(Termination::NothingFits));
        }
        candidate = (candidate / 2).max(lo_floor);
    };

    if rec.trials.len() == 1 {
        return Ok(rec.finish(Termination::DeclaredMaxFits));
    }

    // Bisection phase: lo fits, hi does not
    let mut hi = known_bad;
    let mut iterations = 0u32;
    while hi - lo > bounds.resolution {
        if iterations >= bounds.max_iterations {
            return Ok(rec.finish(Termination::IterationCap));
        }
        iterations += 1;

        let mid = lo + (hi - lo) / 2;
        let fits = rec.push(probe(mid).await?);
        if rec.abandoned {
            return Ok(rec.finish(Termination::Abandoned));
        }
        if fits {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    Ok(rec.finish(Termination::Converged))
}
