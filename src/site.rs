use ahash::AHashMap;

use crate::error::{DisaggError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    pub sid: u32,
    pub lon: f64,
    pub lat: f64,
}

impl Site {
    pub fn new(sid: u32, lon: f64, lat: f64) -> Self {
        Self { sid, lon, lat }
    }
}

/// `sid -> local position` lookup, sized by the number of sites rather than
/// by the largest id.
#[derive(Debug, Clone, Default)]
pub struct SidIndex {
    positions: AHashMap<u32, usize>,
}

impl SidIndex {
    pub fn build(sids: &[u32]) -> Self {
        let positions = sids.iter().enumerate().map(|(pos, &sid)| (sid, pos)).collect();
        Self { positions }
    }

    #[inline]
    pub fn get(&self, sid: u32) -> Option<usize> {
        self.positions.get(&sid).copied()
    }
}

/// Ordered set of sites with unique ids. Sealed on construction.
#[derive(Debug, Clone)]
pub struct SiteCollection {
    sites: Vec<Site>,
    sids: Vec<u32>,
    index: SidIndex,
}

impl SiteCollection {
    pub fn new(mut sites: Vec<Site>) -> Result<Self> {
        sites.sort_by_key(|s| s.sid);
        if let Some(w) = sites.windows(2).find(|w| w[0].sid == w[1].sid) {
            return Err(DisaggError::invalid(format!(
                "site id {} appears more than once",
                w[0].sid
            )));
        }
        if let Some(s) = sites
            .iter()
            .find(|s| !(-180.0..=180.0).contains(&s.lon) || !(-90.0..=90.0).contains(&s.lat))
        {
            return Err(DisaggError::invalid(format!(
                "site #{} has invalid coordinates ({}, {})",
                s.sid, s.lon, s.lat
            )));
        }
        let sids: Vec<u32> = sites.iter().map(|s| s.sid).collect();
        let index = SidIndex::build(&sids);
        Ok(Self { sites, sids, index })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn sids(&self) -> &[u32] {
        &self.sids
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Site> {
        self.sites.iter()
    }

    #[inline]
    pub fn get(&self, pos: usize) -> &Site {
        &self.sites[pos]
    }

    #[inline]
    pub fn position(&self, sid: u32) -> Option<usize> {
        self.index.get(sid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_sorts_and_indexes() {
        let sc = SiteCollection::new(vec![Site::new(5, 1.0, 1.0), Site::new(2, 0.0, 0.0)]).unwrap();
        assert_eq!(sc.sids(), &[2, 5]);
        assert_eq!(sc.position(5), Some(1));
        assert_eq!(sc.position(3), None);
        assert_eq!(sc.position(99), None);
    }

    #[test]
    fn sparse_large_sids_stay_small() {
        let sc = SiteCollection::new(vec![
            Site::new(100_000_000, 0.0, 0.0),
            Site::new(u32::MAX, 1.0, 1.0),
        ])
        .unwrap();
        assert_eq!(sc.position(100_000_000), Some(0));
        assert_eq!(sc.position(u32::MAX), Some(1));
        assert_eq!(sc.position(7), None);
        assert_eq!(sc.index.positions.len(), 2);
    }

    #[test]
    fn duplicate_sids_are_rejected() {
        let err = SiteCollection::new(vec![Site::new(1, 0.0, 0.0), Site::new(1, 1.0, 1.0)]);
        assert!(err.is_err());
    }
}
