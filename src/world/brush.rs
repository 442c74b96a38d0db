//! Axis-aligned box world.
//!
//! Map geometry is a list of solid boxes. Box traces are answered by
//! expanding every brush by the trace extents and running a slab test,
//! which is exact for axis-aligned geometry. Player entities collide as
//! boxes when the mask includes `BODY`.

use crate::util::vec3::Vec3;
use crate::world::{
    ContentMask, EntityId, EntityState, SurfaceFlags, TraceResult, World, PLAYER_MAXS,
    PLAYER_MINS,
};

/// Tolerance used to treat touching as non-penetrating
const SURFACE_EPSILON: f32 = 0.01;

/// A solid box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Brush {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub contents: ContentMask,
    pub surface: SurfaceFlags,
}

impl Brush {
    pub fn solid(mins: Vec3, maxs: Vec3) -> Self {
        Self {
            mins,
            maxs,
            contents: ContentMask::SOLID,
            surface: SurfaceFlags::empty(),
        }
    }
}

/// In-memory world made of boxes plus an entity array
#[derive(Debug, Clone)]
pub struct BrushWorld {
    brushes: Vec<Brush>,
    entities: Vec<EntityState>,
    bounds: (Vec3, Vec3),
    time: f32,
}

impl BrushWorld {
    pub fn new(mins: Vec3, maxs: Vec3) -> Self {
        Self {
            brushes: Vec::new(),
            entities: Vec::new(),
            bounds: (mins, maxs),
            time: 0.0,
        }
    }

    /// Square room with a floor at z=0 and four walls
    pub fn arena(half_size: f32, wall_height: f32) -> Self {
        let mut world = Self::new(
            Vec3::new(-half_size, -half_size, 0.0),
            Vec3::new(half_size, half_size, wall_height),
        );
        let t = 16.0;
        world.add_brush(Brush::solid(
            Vec3::new(-half_size - t, -half_size - t, -t),
            Vec3::new(half_size + t, half_size + t, 0.0),
        ));
        world.add_box(Vec3::new(-half_size - t, -half_size - t, 0.0), Vec3::new(half_size + t, -half_size, wall_height));
        world.add_box(Vec3::new(-half_size - t, half_size, 0.0), Vec3::new(half_size + t, half_size + t, wall_height));
        world.add_box(Vec3::new(-half_size - t, -half_size, 0.0), Vec3::new(-half_size, half_size, wall_height));
        world.add_box(Vec3::new(half_size, -half_size, 0.0), Vec3::new(half_size + t, half_size, wall_height));
        world
    }

    pub fn add_brush(&mut self, brush: Brush) {
        self.brushes.push(brush);
    }

    pub fn add_box(&mut self, mins: Vec3, maxs: Vec3) {
        self.add_brush(Brush::solid(mins, maxs));
    }

    pub fn brushes(&self) -> &[Brush] {
        &self.brushes
    }

    /// Append an entity, assigning it the next free id
    pub fn spawn(&mut self, mut entity: EntityState) -> EntityId {
        let id = self.entities.len();
        entity.id = id;
        self.entities.push(entity);
        id
    }

    /// Place an entity at a specific id, growing the array with unused slots
    pub fn insert_at(&mut self, id: EntityId, mut entity: EntityState) {
        if self.entities.len() <= id {
            self.entities.resize_with(id + 1, EntityState::default);
            for (i, e) in self.entities.iter_mut().enumerate() {
                e.id = i;
            }
        }
        entity.id = id;
        self.entities[id] = entity;
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntityState> {
        self.entities.get_mut(id)
    }

    pub fn entities_mut(&mut self) -> &mut [EntityState] {
        &mut self.entities
    }

    pub fn advance(&mut self, dt: f32) {
        self.time += dt;
    }

    fn trace_box(
        start: Vec3,
        end: Vec3,
        mins: Vec3,
        maxs: Vec3,
        box_mins: Vec3,
        box_maxs: Vec3,
    ) -> Option<(f32, Vec3, bool)> {
        // Minkowski-expand the target box by the moving box extents
        let lo = box_mins - maxs;
        let hi = box_maxs - mins;
        let dir = end - start;

        let mut t_enter = f32::NEG_INFINITY;
        let mut t_exit = f32::INFINITY;
        let mut normal = Vec3::ZERO;

        for axis in 0..3 {
            let o = start[axis];
            let d = dir[axis];
            let (min, max) = (lo[axis], hi[axis]);
            if d.abs() < 1e-6 {
                if o <= min + SURFACE_EPSILON || o >= max - SURFACE_EPSILON {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let (mut t0, mut t1) = ((min - o) * inv, (max - o) * inv);
            let mut n = axis_normal(axis, -1.0);
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
                n = axis_normal(axis, 1.0);
            }
            if t0 > t_enter {
                t_enter = t0;
                normal = n;
            }
            t_exit = t_exit.min(t1);
        }

        let length = dir.length();
        let eps_t = if length > 0.0 { SURFACE_EPSILON / length } else { 0.0 };

        if t_exit <= eps_t || t_enter >= t_exit || t_enter > 1.0 {
            return None;
        }
        if t_enter < -eps_t {
            return Some((0.0, Vec3::ZERO, true));
        }
        // Stop just short of the surface so the next trace does not start inside
        Some(((t_enter - eps_t).max(0.0), normal, false))
    }
}

fn axis_normal(axis: usize, sign: f32) -> Vec3 {
    match axis {
        0 => Vec3::new(sign, 0.0, 0.0),
        1 => Vec3::new(0.0, sign, 0.0),
        _ => Vec3::new(0.0, 0.0, sign),
    }
}

impl World for BrushWorld {
    fn time(&self) -> f32 {
        self.time
    }

    fn trace(
        &self,
        start: Vec3,
        mins: Vec3,
        maxs: Vec3,
        end: Vec3,
        ignore: Option<EntityId>,
        mask: ContentMask,
    ) -> TraceResult {
        let mut best = TraceResult::clear(end);

        for brush in &self.brushes {
            if !brush.contents.intersects(mask) {
                continue;
            }
            if let Some((t, normal, start_solid)) =
                Self::trace_box(start, end, mins, maxs, brush.mins, brush.maxs)
            {
                if t < best.fraction || (start_solid && !best.start_solid) {
                    best.fraction = t;
                    best.hit_normal = normal;
                    best.hit_entity = None;
                    best.surface_flags = brush.surface;
                    best.start_solid = start_solid;
                }
            }
        }

        if mask.contains(ContentMask::BODY) {
            for entity in &self.entities {
                if !entity.is_alive_player() || Some(entity.id) == ignore {
                    continue;
                }
                let box_mins = entity.position + PLAYER_MINS;
                let box_maxs = entity.position + PLAYER_MAXS;
                if let Some((t, normal, start_solid)) =
                    Self::trace_box(start, end, mins, maxs, box_mins, box_maxs)
                {
                    if t < best.fraction {
                        best.fraction = t;
                        best.hit_normal = normal;
                        best.hit_entity = Some(entity.id);
                        best.surface_flags = SurfaceFlags::empty();
                        best.start_solid = start_solid;
                    }
                }
            }
        }

        best.end_position = start + (end - start) * best.fraction;
        best
    }

    fn entities(&self) -> &[EntityState] {
        &self.entities
    }

    fn bounds(&self) -> (Vec3, Vec3) {
        self.bounds
    }
}

/// A player whose box rests on a floor at z=0
pub fn standing_player(id: EntityId, x: f32, y: f32, team: crate::world::Team) -> EntityState {
    EntityState::player(id, Vec3::new(x, y, -PLAYER_MINS.z), team)
}
