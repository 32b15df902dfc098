//! Exception regions and loops.

use super::{InstrIdx, RegionIdx, SymIdx};
use vob::Vob;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// The function body outside any `try`.
    Root,
    Try,
    Catch,
    Finally,
}

/// A structured exception region. Code inside a non-root region runs in a "fake frame" entered
/// through a runtime helper, and leaves it by returning a continuation address to that helper.
#[derive(Clone, Debug)]
pub struct Region {
    pub kind: RegionKind,
    pub parent: Option<RegionIdx>,
    /// The label that starts the region's handler (for `Try` regions).
    pub handler: Option<InstrIdx>,
    /// Bailouts inside this region return through this thunk. Created lazily by the lowerer.
    pub(crate) bail_thunk: Option<InstrIdx>,
}

impl Region {
    pub(crate) fn root() -> Self {
        Self {
            kind: RegionKind::Root,
            parent: None,
            handler: None,
            bail_thunk: None,
        }
    }

    pub fn new(kind: RegionKind, parent: RegionIdx) -> Self {
        Self {
            kind,
            parent: Some(parent),
            handler: None,
            bail_thunk: None,
        }
    }
}

/// A loop, identified by its header label.
///
/// Back-edge liveness is supplied by the optimiser and only covers the symbols that existed when
/// it was computed. Symbols created later (e.g. lowering temporaries) never cross a back edge.
#[derive(Clone, Debug)]
pub struct Loop {
    pub header: InstrIdx,
    /// One bit per symbol: set if the symbol is live on the loop's back edge.
    pub(crate) live_on_back_edge: Vob,
}

impl Loop {
    pub fn is_live_on_back_edge(&self, sidx: SymIdx) -> bool {
        self.live_on_back_edge
            .get(usize::from(sidx))
            .unwrap_or(false)
    }

    pub fn set_live_on_back_edge(&mut self, sidx: SymIdx) {
        let i = usize::from(sidx);
        if i >= self.live_on_back_edge.len() {
            self.live_on_back_edge.resize(i + 1, false);
        }
        self.live_on_back_edge.set(i, true);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn back_edge_liveness_grows() {
        let mut l = Loop {
            header: InstrIdx::from_usize(0),
            live_on_back_edge: Vob::from_elem(false, 2),
        };
        let (s1, s9) = (SymIdx::from_usize(1), SymIdx::from_usize(9));
        assert!(!l.is_live_on_back_edge(s9));
        l.set_live_on_back_edge(s1);
        l.set_live_on_back_edge(s9);
        assert!(l.is_live_on_back_edge(s1));
        assert!(l.is_live_on_back_edge(s9));
        assert!(!l.is_live_on_back_edge(SymIdx::from_usize(5)));
        assert!(!l.is_live_on_back_edge(SymIdx::from_usize(100)));
    }
}
