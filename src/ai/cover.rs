//! Cover point analysis and selection
//!
//! Map analysis runs once per map: it samples a 3-D grid over the playable
//! bounds, keeps standable ground points that have something solid nearby,
//! classifies them and links nearby points into a graph. Selection then
//! scores candidates around a bot against a threat position.

use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::ai::constants::cover::{
    APPROACH_SAMPLES, CONNECT_CLEAR_RATIO, CONNECT_RADIUS, DEFAULT_GRID_SPACING, HASH_CELL_SIZE,
    MAX_CONNECTIONS, MAX_COVER_POINTS, MIN_GROUND_NORMAL, OPTIMAL_THREAT_DISTANCE, OVERHEAD_PROBE,
    PEEK_OFFSET, PROBE_DISTANCE, PROBE_HEIGHTS, RECENT_USE_PENALTY, RECENT_USE_TIME, STEP_HEIGHT,
};
use crate::ai::constants::perception::EYE_HEIGHT;
use crate::util::vec3::Vec3;
use crate::world::{ContentMask, EntityId, World, PLAYER_MAXS, PLAYER_MINS};

/// Index of a cover point inside its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoverId(pub u32);

impl CoverId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoverType {
    /// Waist-high obstruction
    Low,
    /// Obstruction taller than a standing player
    High,
    /// Partial wrap on one side
    Corner,
    /// Obstructed all the way around
    Pillar,
    /// Little obstruction, barely cover
    Edge,
    /// Solid sill and lintel around a chest-high gap
    Window,
    /// Blocked on two opposite sides, open front and back
    Door,
}

impl CoverType {
    /// Protection a perfectly placed point of this type gives
    pub fn base_protection(self) -> f32 {
        match self {
            CoverType::Pillar => 1.0,
            CoverType::High => 0.9,
            CoverType::Corner => 0.7,
            CoverType::Low => 0.6,
            CoverType::Edge => 0.3,
            CoverType::Window => 0.8,
            CoverType::Door => 0.5,
        }
    }

    fn base_quality(self) -> f32 {
        match self {
            CoverType::Pillar => 0.9,
            CoverType::High => 0.8,
            CoverType::Corner => 0.6,
            CoverType::Low => 0.5,
            CoverType::Edge => 0.3,
            CoverType::Window => 0.7,
            CoverType::Door => 0.4,
        }
    }
}

/// Bit index of the 45 degree probe sector nearest a horizontal direction
fn sector_of(dir: Vec3) -> u32 {
    let (_, yaw) = dir.to_angles();
    ((yaw.rem_euclid(360.0) / 45.0).round() as u32) % 8
}

/// One analyzed cover location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverPoint {
    pub id: CoverId,
    /// Ground point the bot stands on
    pub position: Vec3,
    /// Horizontal unit vector from the point toward its obstruction
    pub normal: Vec3,
    pub cover_type: CoverType,
    /// 0..1
    pub quality: f32,
    /// Fraction of probe directions that were blocked
    pub blocked_ratio: f32,
    /// Highest blocked probe above the ground point
    pub height: f32,
    /// Bit k set when the probe at yaw k*45 was blocked
    pub protection_mask: u8,
    pub overhead: bool,
    pub peek_left: bool,
    pub peek_right: bool,
    pub peek_over: bool,
    pub is_corner: bool,
    pub connections: SmallVec<[CoverId; MAX_CONNECTIONS]>,
    pub last_used: Option<f32>,
    pub use_count: u32,
    pub occupied_by: Option<EntityId>,
}

impl CoverPoint {
    /// Bare point with no analysis results, for hand-placed cover
    pub fn new(position: Vec3, normal: Vec3, cover_type: CoverType, blocked_ratio: f32) -> Self {
        Self {
            id: CoverId(0),
            position,
            normal: normal.flat().normalize(),
            cover_type,
            quality: cover_type.base_quality(),
            blocked_ratio: blocked_ratio.clamp(0.0, 1.0),
            height: 0.0,
            protection_mask: 0,
            overhead: false,
            peek_left: false,
            peek_right: false,
            peek_over: false,
            is_corner: blocked_ratio > 0.2 && blocked_ratio < 0.5,
            connections: SmallVec::new(),
            last_used: None,
            use_count: 0,
            occupied_by: None,
        }
    }

    /// Whether the probe sector facing `dir` was blocked during analysis
    pub fn blocks(&self, dir: Vec3) -> bool {
        self.protection_mask & (1 << sector_of(dir)) != 0
    }

    fn recently_used(&self, now: f32) -> bool {
        self.last_used.map_or(false, |t| now - t < RECENT_USE_TIME)
    }
}

/// Result of probing a ground point
#[derive(Debug, Clone, Copy)]
pub struct CoverProbe {
    pub cover_type: CoverType,
    pub quality: f32,
    pub blocked_ratio: f32,
    pub height: f32,
    pub protection_mask: u8,
    pub normal: Vec3,
    pub overhead: bool,
}

/// Caller constraints for a cover search
#[derive(Debug, Clone, Copy)]
pub struct CoverParams {
    pub search_radius: f32,
    pub min_threat_distance: f32,
    pub max_threat_distance: f32,
    pub preferred_direction: Option<Vec3>,
    pub preferred_type: Option<CoverType>,
    /// 0..1, higher favors closer cover
    pub urgency: f32,
    /// Bot asking, so its own claim does not exclude the point
    pub requester: Option<EntityId>,
}

impl Default for CoverParams {
    fn default() -> Self {
        Self {
            search_radius: 1000.0,
            min_threat_distance: 0.0,
            max_threat_distance: f32::MAX,
            preferred_direction: None,
            preferred_type: None,
            urgency: 0.0,
            requester: None,
        }
    }
}

/// Per-component score of a candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverEvaluation {
    pub id: CoverId,
    pub protection: f32,
    pub position: f32,
    pub tactical: f32,
    pub accessibility: f32,
    pub total: f32,
}

type CellKey = (i32, i32);

/// Cover points plus a spatial hash over them
#[derive(Debug, Clone, Default)]
pub struct CoverManager {
    points: Vec<CoverPoint>,
    cells: FxHashMap<CellKey, SmallVec<[CoverId; 8]>>,
    /// Inclusive min and max of the occupied cells
    cell_extent: Option<(CellKey, CellKey)>,
    spacing: f32,
}

impl CoverManager {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            cells: FxHashMap::default(),
            cell_extent: None,
            spacing: DEFAULT_GRID_SPACING,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CoverPoint] {
        &self.points
    }

    pub fn point(&self, id: CoverId) -> Option<&CoverPoint> {
        self.points.get(id.index())
    }

    /// Grid spacing used by the last analysis
    pub fn spacing(&self) -> f32 {
        self.spacing
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.cells.clear();
        self.cell_extent = None;
    }

    #[inline]
    fn cell_of(position: Vec3) -> CellKey {
        (
            (position.x / HASH_CELL_SIZE).floor() as i32,
            (position.y / HASH_CELL_SIZE).floor() as i32,
        )
    }

    /// Insert a point, returning its id. Returns None once the cap is reached.
    pub fn add_point(&mut self, mut point: CoverPoint) -> Option<CoverId> {
        if self.points.len() >= MAX_COVER_POINTS {
            return None;
        }
        let id = CoverId(self.points.len() as u32);
        point.id = id;
        let key = Self::cell_of(point.position);
        self.cells.entry(key).or_default().push(id);
        self.cell_extent = Some(match self.cell_extent {
            Some((lo, hi)) => ((lo.0.min(key.0), lo.1.min(key.1)), (hi.0.max(key.0), hi.1.max(key.1))),
            None => (key, key),
        });
        self.points.push(point);
        Some(id)
    }

    /// Ids of points within `radius` of `center` (horizontal distance)
    pub fn points_within(&self, center: Vec3, radius: f32) -> impl Iterator<Item = CoverId> + '_ {
        let (cx, cy) = Self::cell_of(center);
        // Scan only cells that can hold points; huge radii stay bounded
        let reach = (radius.max(0.0) / HASH_CELL_SIZE).ceil() as i64;
        let clamp = |c: i32, lo: i32, hi: i32| {
            let c = i64::from(c);
            ((c - reach).max(i64::from(lo)) as i32, (c + reach).min(i64::from(hi)) as i32)
        };
        let ((x0, x1), (y0, y1)) = match self.cell_extent {
            Some((lo, hi)) => (clamp(cx, lo.0, hi.0), clamp(cy, lo.1, hi.1)),
            None => ((1, 0), (1, 0)),
        };
        let radius_sq = radius * radius;
        (x0..=x1)
            .flat_map(move |x| (y0..=y1).map(move |y| (x, y)))
            .filter_map(move |key| self.cells.get(&key))
            .flat_map(|cell| cell.iter().copied())
            .filter(move |id| {
                self.points[id.index()].position.flat().distance_sq_to(center.flat()) <= radius_sq
            })
    }

    /// Analyze the world's playable bounds. Replaces any existing points.
    pub fn analyze_map<W: World + Sync + ?Sized>(&mut self, world: &W, spacing: f32) -> usize {
        self.clear();
        self.spacing = if spacing > 0.0 { spacing } else { DEFAULT_GRID_SPACING };
        let step = self.spacing;
        let (mins, maxs) = world.bounds();
        let nx = ((maxs.x - mins.x) / step).floor().max(0.0) as usize + 1;
        let ny = ((maxs.y - mins.y) / step).floor().max(0.0) as usize + 1;
        let nz = ((maxs.z - mins.z) / step).floor().max(0.0) as usize + 1;

        // Column scans are independent; results stay in grid order
        let candidates: Vec<CoverPoint> = (0..nx)
            .into_par_iter()
            .flat_map_iter(|ix| {
                let x = mins.x + ix as f32 * step;
                (0..ny).flat_map(move |iy| {
                    let y = mins.y + iy as f32 * step;
                    (0..nz).filter_map(move |iz| {
                        let z = mins.z + iz as f32 * step;
                        let ground = find_ground(world, Vec3::new(x, y, z))?;
                        let probe = validate_cover_point(world, ground)?;
                        let mut point = CoverPoint::new(ground, probe.normal, probe.cover_type, probe.blocked_ratio);
                        point.quality = probe.quality;
                        point.height = probe.height;
                        point.protection_mask = probe.protection_mask;
                        point.overhead = probe.overhead;
                        analyze_cover_properties(world, &mut point);
                        Some(point)
                    })
                })
            })
            .collect();

        let sampled = candidates.len();
        for point in candidates {
            if self.add_point(point).is_none() {
                break;
            }
        }
        self.connect_points(world);

        info!(
            points = self.points.len(),
            sampled,
            spacing = step,
            pillars = self.count_type(CoverType::Pillar),
            high = self.count_type(CoverType::High),
            corners = self.count_type(CoverType::Corner),
            windows = self.count_type(CoverType::Window),
            doors = self.count_type(CoverType::Door),
            "Cover analysis complete"
        );
        self.points.len()
    }

    fn count_type(&self, cover_type: CoverType) -> usize {
        self.points.iter().filter(|p| p.cover_type == cover_type).count()
    }

    /// Link points within reach whose straight path is mostly clear, then
    /// adjust quality by connectivity
    pub fn connect_points<W: World + Sync + ?Sized>(&mut self, world: &W) {
        for p in &mut self.points {
            p.connections.clear();
        }
        let points = &self.points;
        let edges: Vec<(CoverId, CoverId)> = points
            .par_iter()
            .flat_map_iter(|a| {
                self.points_within(a.position, CONNECT_RADIUS)
                    .filter(move |b| *b > a.id)
                    .filter(move |b| {
                        let eye = Vec3::new(0.0, 0.0, EYE_HEIGHT);
                        let tr = world.trace_line(
                            a.position + eye,
                            points[b.index()].position + eye,
                            None,
                            ContentMask::SOLID,
                        );
                        tr.fraction >= CONNECT_CLEAR_RATIO
                    })
                    .map(move |b| (a.id, b))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (a, b) in edges {
            let (ia, ib) = (a.index(), b.index());
            if self.points[ia].connections.len() >= MAX_CONNECTIONS
                || self.points[ib].connections.len() >= MAX_CONNECTIONS
            {
                continue;
            }
            self.points[ia].connections.push(b);
            self.points[ib].connections.push(a);
        }

        for p in &mut self.points {
            if p.connections.len() >= 3 {
                p.quality = (p.quality + 0.1).min(1.0);
            } else if p.connections.is_empty() {
                p.quality = (p.quality - 0.1).max(0.0);
            }
        }
    }

    /// Best scoring cover near `from` against a threat at `threat`
    pub fn find_best_cover<W: World + ?Sized>(
        &self,
        world: &W,
        from: Vec3,
        threat: Vec3,
        params: &CoverParams,
        now: f32,
    ) -> Option<CoverEvaluation> {
        let best = self
            .points_within(from, params.search_radius)
            .filter(|id| {
                let p = &self.points[id.index()];
                let d = p.position.distance_to(threat);
                let free = p.occupied_by.is_none() || p.occupied_by == params.requester;
                free && d >= params.min_threat_distance && d <= params.max_threat_distance
            })
            .map(|id| self.evaluate_point(world, id, from, threat, params, now))
            .max_by(|a, b| a.total.total_cmp(&b.total).then(b.id.cmp(&a.id)));

        if let Some(eval) = &best {
            debug!(
                cover = eval.id.0,
                total = eval.total,
                protection = eval.protection,
                "Cover selected"
            );
        }
        best
    }

    /// Score one point. Weights: protection 0.4, position 0.25, tactical 0.15,
    /// accessibility 0.2. Points used within the last 10s lose 30%.
    pub fn evaluate_point<W: World + ?Sized>(
        &self,
        world: &W,
        id: CoverId,
        from: Vec3,
        threat: Vec3,
        params: &CoverParams,
        now: f32,
    ) -> CoverEvaluation {
        let p = &self.points[id.index()];
        let protection = calculate_protection(p, threat);

        let threat_distance = p.position.distance_to(threat);
        let mut position =
            (1.0 - (threat_distance - OPTIMAL_THREAT_DISTANCE).abs() / OPTIMAL_THREAT_DISTANCE).clamp(0.0, 1.0);
        if let Some(pref) = params.preferred_direction {
            let toward = (p.position - from).flat().normalize();
            position += 0.2 * toward.dot(pref.flat().normalize()).max(0.0);
        }
        let position = position.min(1.0);

        let mut tactical: f32 = 0.0;
        if p.is_corner {
            tactical += 0.3;
        }
        if p.peek_left {
            tactical += 0.2;
        }
        if p.peek_right {
            tactical += 0.2;
        }
        if p.peek_over {
            tactical += 0.1;
        }
        if params.preferred_type == Some(p.cover_type) {
            tactical += 0.2;
        }
        let tactical = tactical.min(1.0);

        let hidden = approach_hidden_ratio(world, from, p.position, threat);
        let travel = from.distance_to(p.position);
        let closeness = if params.search_radius > 0.0 {
            (1.0 - travel / params.search_radius).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let accessibility = (hidden + params.urgency.clamp(0.0, 1.0) * 0.3 * closeness).min(1.0);

        let mut total = 0.4 * protection + 0.25 * position + 0.15 * tactical + 0.2 * accessibility;
        if p.recently_used(now) {
            total *= 1.0 - RECENT_USE_PENALTY;
        }
        CoverEvaluation {
            id,
            protection,
            position,
            tactical,
            accessibility,
            total,
        }
    }

    /// Mark a point as taken
    pub fn claim(&mut self, id: CoverId, entity: EntityId, now: f32) -> bool {
        match self.points.get_mut(id.index()) {
            Some(p) if p.occupied_by.is_none() || p.occupied_by == Some(entity) => {
                p.occupied_by = Some(entity);
                p.last_used = Some(now);
                p.use_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Release every point held by `entity`
    pub fn release(&mut self, entity: EntityId) {
        for p in &mut self.points {
            if p.occupied_by == Some(entity) {
                p.occupied_by = None;
            }
        }
    }

    pub fn nearest(&self, position: Vec3) -> Option<CoverId> {
        self.points
            .iter()
            .min_by(|a, b| a.position.distance_sq_to(position).total_cmp(&b.position.distance_sq_to(position)))
            .map(|p| p.id)
    }
}

/// Protection a point gives against a threat position, always in `[0, 1]`
pub fn calculate_protection(point: &CoverPoint, threat: Vec3) -> f32 {
    let to_threat = (threat - point.position).flat().normalize();
    let facing = if point.cover_type == CoverType::Pillar || point.blocks(to_threat) {
        1.0
    } else {
        point.normal.dot(to_threat)
    };
    let alignment = 0.5 + 0.5 * facing;
    let coverage = 0.5 + 0.5 * point.blocked_ratio;
    let value = point.cover_type.base_protection() * alignment * coverage;
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Standable ground within one step of `sample`
fn find_ground<W: World + ?Sized>(world: &W, sample: Vec3) -> Option<Vec3> {
    let start = sample + Vec3::new(0.0, 0.0, STEP_HEIGHT);
    let end = sample - Vec3::new(0.0, 0.0, STEP_HEIGHT);
    let tr = world.trace_line(start, end, None, ContentMask::SOLID);
    if tr.start_solid || !tr.hit() || tr.hit_normal.z <= MIN_GROUND_NORMAL {
        return None;
    }
    let ground = tr.end_position;

    // A standing player box must fit
    let stand = ground + Vec3::new(0.0, 0.0, 1.0 - PLAYER_MINS.z);
    let fit = world.trace(stand, PLAYER_MINS, PLAYER_MAXS, stand + Vec3::UP, None, ContentMask::PLAYER_SOLID);
    if fit.start_solid {
        return None;
    }
    Some(ground)
}

/// Probe 8 directions at 3 heights and classify the point
pub fn validate_cover_point<W: World + ?Sized>(world: &W, ground: Vec3) -> Option<CoverProbe> {
    let mut blocked = 0usize;
    let mut mask = 0u8;
    let mut window = false;
    let mut max_height: f32 = 0.0;
    let mut normal_sum = Vec3::ZERO;
    let mut first_blocked = None;

    for k in 0..8 {
        let dir = Vec3::from_yaw(k as f32 * 45.0);
        let mut hits = [false; PROBE_HEIGHTS.len()];
        let mut top = None;
        for (i, &h) in PROBE_HEIGHTS.iter().enumerate() {
            let start = ground + Vec3::new(0.0, 0.0, h);
            let tr = world.trace_line(start, start + dir * PROBE_DISTANCE, None, ContentMask::SOLID);
            if tr.hit() {
                hits[i] = true;
                top = Some(h);
            }
        }
        if hits[0] && !hits[1] && hits[hits.len() - 1] {
            window = true;
        }
        if let Some(h) = top {
            blocked += 1;
            mask |= 1 << k;
            max_height = max_height.max(h);
            normal_sum += dir;
            first_blocked.get_or_insert(dir);
        }
    }

    if blocked == 0 {
        return None;
    }
    let ratio = blocked as f32 / 8.0;
    let tallest = PROBE_HEIGHTS[PROBE_HEIGHTS.len() - 1];
    let is_set = |k: usize| mask & (1 << (k % 8)) != 0;
    let doorway = blocked <= 4 && (0..4).any(|k| is_set(k) && is_set(k + 4) && !is_set(k + 2) && !is_set(k + 6));

    let cover_type = if blocked == 8 {
        CoverType::Pillar
    } else if window {
        CoverType::Window
    } else if doorway {
        CoverType::Door
    } else if ratio > 0.5 {
        if max_height >= tallest {
            CoverType::High
        } else {
            CoverType::Low
        }
    } else if ratio >= 0.3 {
        CoverType::Corner
    } else {
        CoverType::Edge
    };

    let normal = if normal_sum.length_xy() > 1e-3 {
        normal_sum.flat().normalize()
    } else {
        first_blocked.unwrap_or(Vec3::FORWARD)
    };

    let head = ground + Vec3::new(0.0, 0.0, tallest);
    let overhead = world
        .trace_line(head, head + Vec3::new(0.0, 0.0, OVERHEAD_PROBE), None, ContentMask::SOLID)
        .hit();

    let mut quality = cover_type.base_quality();
    if overhead {
        quality += 0.1;
    }

    Some(CoverProbe {
        cover_type,
        quality: quality.min(1.0),
        blocked_ratio: ratio,
        height: max_height,
        protection_mask: mask,
        normal,
        overhead,
    })
}

/// Peek feasibility and the corner flag
pub fn analyze_cover_properties<W: World + ?Sized>(world: &W, point: &mut CoverPoint) {
    let eye = point.position + Vec3::new(0.0, 0.0, EYE_HEIGHT);
    let left = point.normal.perpendicular_xy();

    let can_peek = |side: Vec3| {
        let offset = eye + side * PEEK_OFFSET;
        let step_out = world.trace_line(eye, offset, None, ContentMask::SOLID);
        if step_out.hit() {
            return false;
        }
        let look = world.trace_line(offset, offset + point.normal * PROBE_DISTANCE, None, ContentMask::SOLID);
        !look.hit()
    };
    point.peek_left = can_peek(left);
    point.peek_right = can_peek(-left);

    point.peek_over = point.cover_type == CoverType::Low && {
        let over = point.position + Vec3::new(0.0, 0.0, PROBE_HEIGHTS[PROBE_HEIGHTS.len() - 1] + 8.0);
        !world
            .trace_line(over, over + point.normal * PROBE_DISTANCE, None, ContentMask::SOLID)
            .hit()
    };

    point.is_corner = point.blocked_ratio > 0.2 && point.blocked_ratio < 0.5;
}

/// Fraction of samples along the approach that the threat cannot see
fn approach_hidden_ratio<W: World + ?Sized>(world: &W, from: Vec3, to: Vec3, threat: Vec3) -> f32 {
    let eye = Vec3::new(0.0, 0.0, EYE_HEIGHT);
    let threat_eye = threat + eye;
    let mut hidden = 0;
    for i in 0..APPROACH_SAMPLES {
        let t = (i + 1) as f32 / APPROACH_SAMPLES as f32;
        let sample = from.lerp(to, t) + eye;
        if world.trace_line(threat_eye, sample, None, ContentMask::SOLID).hit() {
            hidden += 1;
        }
    }
    hidden as f32 / APPROACH_SAMPLES as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::BrushWorld;

    fn pillar_room() -> BrushWorld {
        let mut world = BrushWorld::arena(512.0, 256.0);
        world.add_box(Vec3::new(-48.0, -48.0, 0.0), Vec3::new(48.0, 48.0, 192.0));
        world
    }

    // ========================================================================
    // Protection
    // ========================================================================

    #[test]
    fn test_protection_facing_threat() {
        let p = CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::High, 0.6);
        let front = calculate_protection(&p, Vec3::new(500.0, 0.0, 0.0));
        let behind = calculate_protection(&p, Vec3::new(-500.0, 0.0, 0.0));
        assert!(front > behind);
        assert_eq!(behind, 0.0);
    }

    #[test]
    fn test_protection_pillar_all_round() {
        let p = CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::Pillar, 1.0);
        assert_eq!(calculate_protection(&p, Vec3::new(-300.0, 10.0, 0.0)), 1.0);
        assert_eq!(calculate_protection(&p, Vec3::ZERO), 1.0);
    }

    #[test]
    fn test_protection_threat_on_point() {
        let p = CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::Edge, 0.1);
        let v = calculate_protection(&p, Vec3::ZERO);
        assert!((0.0..=1.0).contains(&v));
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    #[test]
    fn test_validate_against_wall() {
        let world = pillar_room();
        // 20 units east of the pillar face
        let probe = validate_cover_point(&world, Vec3::new(68.0, 0.0, 0.0)).expect("cover");
        assert!(probe.normal.x < -0.9);
        assert_eq!(probe.cover_type, CoverType::Corner);
        assert!(probe.height >= 56.0);
    }

    #[test]
    fn test_validate_open_floor() {
        let world = pillar_room();
        assert!(validate_cover_point(&world, Vec3::new(300.0, -300.0, 0.0)).is_none());
    }

    #[test]
    fn test_peek_properties() {
        let mut world = BrushWorld::arena(512.0, 256.0);
        // Waist-high block straight ahead
        world.add_box(Vec3::new(20.0, -16.0, 0.0), Vec3::new(40.0, 16.0, 30.0));

        let mut low = CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::Low, 0.3);
        analyze_cover_properties(&world, &mut low);
        assert!(low.peek_left && low.peek_right);
        assert!(low.peek_over);
        assert!(low.is_corner);

        // A wall on the left side closes that peek
        world.add_box(Vec3::new(-64.0, 20.0, 0.0), Vec3::new(64.0, 40.0, 128.0));
        let mut high = CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::High, 0.6);
        analyze_cover_properties(&world, &mut high);
        assert!(!high.peek_left);
        assert!(high.peek_right);
        assert!(!high.peek_over);
        assert!(!high.is_corner);
    }

    #[test]
    fn test_validate_doorway() {
        let mut world = BrushWorld::arena(512.0, 256.0);
        // Jambs north and south of the origin
        world.add_box(Vec3::new(-20.0, 40.0, 0.0), Vec3::new(20.0, 60.0, 128.0));
        world.add_box(Vec3::new(-20.0, -60.0, 0.0), Vec3::new(20.0, -40.0, 128.0));
        let probe = validate_cover_point(&world, Vec3::ZERO).expect("cover");
        assert_eq!(probe.cover_type, CoverType::Door);
        assert_eq!(probe.protection_mask, (1 << 2) | (1 << 6));
    }

    #[test]
    fn test_validate_window_and_mask() {
        let mut world = BrushWorld::arena(512.0, 256.0);
        // Sill below the middle probe, lintel above it
        world.add_box(Vec3::new(30.0, -100.0, 0.0), Vec3::new(50.0, 100.0, 24.0));
        world.add_box(Vec3::new(30.0, -100.0, 48.0), Vec3::new(50.0, 100.0, 128.0));
        let probe = validate_cover_point(&world, Vec3::ZERO).expect("cover");
        assert_eq!(probe.cover_type, CoverType::Window);

        let mut point = CoverPoint::new(Vec3::ZERO, probe.normal, probe.cover_type, probe.blocked_ratio);
        point.protection_mask = probe.protection_mask;
        assert!(point.blocks(Vec3::FORWARD));
        assert!(!point.blocks(-Vec3::FORWARD));
        let east = calculate_protection(&point, Vec3::new(600.0, 0.0, 0.0));
        let west = calculate_protection(&point, Vec3::new(-600.0, 0.0, 0.0));
        assert!(east > west);
    }

    #[test]
    fn test_analyze_map_finds_pillar_cover() {
        let world = pillar_room();
        let mut cover = CoverManager::new();
        let n = cover.analyze_map(&world, 64.0);
        assert!(n > 0);
        assert_eq!(n, cover.len());
        // Points hug the pillar or the outer walls
        for p in cover.points() {
            assert!(p.position.z.abs() < 1.0);
            assert!((0.0..=1.0).contains(&p.quality));
            assert!(p.connections.len() <= MAX_CONNECTIONS);
        }
        let near_pillar = cover.points_within(Vec3::ZERO, 100.0).count();
        assert!(near_pillar > 0);
    }

    #[test]
    fn test_connections_are_bidirectional() {
        let world = pillar_room();
        let mut cover = CoverManager::new();
        cover.analyze_map(&world, 64.0);
        for p in cover.points() {
            for c in &p.connections {
                let other = cover.point(*c).expect("connected point");
                assert!(other.connections.contains(&p.id));
            }
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    #[test]
    fn test_prefers_protected_pillar() {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        // Wall between the threat and the far point
        world.add_box(Vec3::new(400.0, -64.0, 0.0), Vec3::new(420.0, 64.0, 128.0));
        let threat = Vec3::ZERO;

        let mut cover = CoverManager::new();
        let exposed = cover
            .add_point(CoverPoint::new(Vec3::new(100.0, 0.0, 0.0), Vec3::FORWARD, CoverType::Edge, 0.0))
            .expect("exposed");
        let pillar = cover
            .add_point(CoverPoint::new(Vec3::new(450.0, 0.0, 0.0), -Vec3::FORWARD, CoverType::Pillar, 1.0))
            .expect("pillar");

        let best = cover
            .find_best_cover(&world, Vec3::new(250.0, 0.0, 0.0), threat, &CoverParams::default(), 0.0)
            .expect("some cover");
        assert_eq!(best.id, pillar);
        assert_ne!(best.id, exposed);
    }

    #[test]
    fn test_threat_distance_bounds_exclude() {
        let world = BrushWorld::arena(1024.0, 256.0);
        let mut cover = CoverManager::new();
        cover.add_point(CoverPoint::new(Vec3::new(100.0, 0.0, 0.0), Vec3::FORWARD, CoverType::High, 0.6));
        let params = CoverParams {
            min_threat_distance: 200.0,
            ..Default::default()
        };
        assert!(cover.find_best_cover(&world, Vec3::ZERO, Vec3::ZERO, &params, 0.0).is_none());
    }

    #[test]
    fn test_recent_use_penalty_and_claims() {
        let world = BrushWorld::arena(1024.0, 256.0);
        let mut cover = CoverManager::new();
        let id = cover
            .add_point(CoverPoint::new(Vec3::new(400.0, 0.0, 0.0), -Vec3::FORWARD, CoverType::High, 0.6))
            .expect("point");
        let params = CoverParams::default();
        let fresh = cover.evaluate_point(&world, id, Vec3::ZERO, Vec3::new(800.0, 0.0, 0.0), &params, 0.0);

        assert!(cover.claim(id, 3, 1.0));
        assert!(!cover.claim(id, 4, 1.0));
        let used = cover.evaluate_point(&world, id, Vec3::ZERO, Vec3::new(800.0, 0.0, 0.0), &params, 2.0);
        assert!((used.total - fresh.total * 0.7).abs() < 1e-4);

        // Occupied points are skipped for other bots
        assert!(cover.find_best_cover(&world, Vec3::ZERO, Vec3::new(800.0, 0.0, 0.0), &params, 2.0).is_none());
        cover.release(3);
        assert!(cover.claim(id, 4, 30.0));
    }

    #[test]
    fn test_cap_on_points() {
        let mut cover = CoverManager::new();
        for i in 0..MAX_COVER_POINTS {
            assert!(cover
                .add_point(CoverPoint::new(Vec3::new(i as f32, 0.0, 0.0), Vec3::FORWARD, CoverType::Edge, 0.1))
                .is_some());
        }
        assert!(cover
            .add_point(CoverPoint::new(Vec3::ZERO, Vec3::FORWARD, CoverType::Edge, 0.1))
            .is_none());
        assert_eq!(cover.len(), MAX_COVER_POINTS);
    }

    #[test]
    fn test_points_within_huge_radius() {
        let mut cover = CoverManager::new();
        assert_eq!(cover.points_within(Vec3::ZERO, f32::INFINITY).count(), 0);
        for (x, y) in [(-3000.0, 0.0), (0.0, 0.0), (5000.0, 4000.0)] {
            cover.add_point(CoverPoint::new(Vec3::new(x, y, 0.0), Vec3::FORWARD, CoverType::Low, 0.5));
        }
        assert_eq!(cover.points_within(Vec3::ZERO, f32::INFINITY).count(), 3);
        assert_eq!(cover.points_within(Vec3::ZERO, f32::MAX).count(), 3);
        assert_eq!(cover.points_within(Vec3::new(1e9, -1e9, 0.0), 1e12).count(), 3);
        assert_eq!(cover.points_within(Vec3::ZERO, 100.0).count(), 1);
        assert_eq!(cover.points_within(Vec3::ZERO, f32::NAN).count(), 0);

        cover.clear();
        assert_eq!(cover.points_within(Vec3::ZERO, f32::INFINITY).count(), 0);
    }
}
