use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::catalog::{CatalogEntry, LocatorCatalog, LocatorStrategy, StrategyKind, Target};
use crate::snapshot::{DeviceSnapshot, Point, Resolution};

/// A strategy that applies to the current screen, reduced to a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLocator {
    pub target: Target,
    /// Position of the strategy in the catalog's priority list.
    pub index: usize,
    pub kind: StrategyKind,
    pub point: Point,
    pub screen: Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no catalog entry for {0}")]
    UnresolvableTarget(Target),

    #[error("no strategy for {0} applies to the current screen")]
    NoCandidate(Target),
}

/// Picks the first catalog strategy that applies to a snapshot.
/// Pure computation: never touches the device.
#[derive(Clone)]
pub struct LocatorResolver {
    catalog: Arc<LocatorCatalog>,
}

impl LocatorResolver {
    pub fn new(catalog: Arc<LocatorCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &LocatorCatalog {
        &self.catalog
    }

    pub fn resolve(
        &self,
        target: Target,
        snapshot: &DeviceSnapshot,
    ) -> Result<ResolvedLocator, ResolveError> {
        self.resolve_excluding(target, snapshot, &[])
    }

    /// Like [`resolve`](Self::resolve), skipping strategies already tried.
    /// Vision strategies are never selected here.
    pub fn resolve_excluding(
        &self,
        target: Target,
        snapshot: &DeviceSnapshot,
        tried: &[usize],
    ) -> Result<ResolvedLocator, ResolveError> {
        let entries = self
            .catalog
            .strategies_for(target)
            .map_err(|_| ResolveError::UnresolvableTarget(target))?;

        for (index, entry) in entries.iter().enumerate() {
            if tried.contains(&index) {
                continue;
            }
            if let Some(point) = locate(entry, snapshot) {
                tracing::debug!(%target, index, kind = %entry.kind(), %point, "Resolved locator");
                return Ok(ResolvedLocator {
                    target,
                    index,
                    kind: entry.kind(),
                    point,
                    screen: snapshot.resolution,
                });
            }
        }

        tracing::debug!(%target, tried = ?tried, "No applicable strategy");
        Err(ResolveError::NoCandidate(target))
    }

    /// Untried vision strategy for `target`, if the catalog has one.
    pub fn vision_fallback(&self, target: Target, tried: &[usize]) -> Option<(usize, &str)> {
        let entries = self.catalog.strategies_for(target).ok()?;
        entries
            .iter()
            .enumerate()
            .filter(|(i, _)| !tried.contains(i))
            .find_map(|(i, e)| match e.strategy() {
                LocatorStrategy::Vision { description } => Some((i, description.as_str())),
                _ => None,
            })
    }
}

fn locate(entry: &CatalogEntry, snapshot: &DeviceSnapshot) -> Option<Point> {
    match entry.strategy() {
        LocatorStrategy::SemanticId { id } => snapshot
            .find_by_id(id)
            .filter(|e| !e.bounds.is_empty())
            .map(|e| e.bounds.center()),
        LocatorStrategy::TextPattern { .. } => {
            let pattern = entry.matcher()?;
            snapshot
                .find_text(pattern)
                .filter(|e| !e.bounds.is_empty())
                .map(|e| e.bounds.center())
        }
        LocatorStrategy::NormalizedCoordinate { x, y, guard } => {
            let screen = snapshot.resolution;
            if *guard != Some(screen) {
                return None;
            }
            Some(to_pixels(*x, *y, screen))
        }
        LocatorStrategy::Vision { .. } => None,
    }
}

/// Normalized 0..1 position to an on-screen pixel.
pub fn to_pixels(x: f64, y: f64, screen: Resolution) -> Point {
    let px = (x * f64::from(screen.width)).round() as i32;
    let py = (y * f64::from(screen.height)).round() as i32;
    Point::new(
        px.clamp(0, screen.width as i32 - 1),
        py.clamp(0, screen.height as i32 - 1),
    )
}
