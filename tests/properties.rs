//! Property tests for the numeric invariants of the decision core

use arena_bot_ai::ai::cover::{calculate_protection, CoverPoint, CoverType};
use arena_bot_ai::ai::neural::{Activation, LayerSpec, NeuralNetwork};
use arena_bot_ai::ai::perception::{PerceptionSystem, ThreatLevel};
use arena_bot_ai::ai::ppo::normalize_advantages;
use arena_bot_ai::ai::skill::{adjust_difficulty, AdaptationState, SkillProfile};
use arena_bot_ai::util::vec3::Vec3;
use arena_bot_ai::world::brush::{standing_player, BrushWorld};
use arena_bot_ai::world::{Team, World};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn cover_type() -> impl Strategy<Value = CoverType> {
    prop_oneof![
        Just(CoverType::Low),
        Just(CoverType::High),
        Just(CoverType::Corner),
        Just(CoverType::Pillar),
        Just(CoverType::Edge),
        Just(CoverType::Window),
        Just(CoverType::Door),
    ]
}

fn activation() -> impl Strategy<Value = Activation> {
    prop_oneof![
        Just(Activation::Linear),
        Just(Activation::ReLU),
        Just(Activation::LeakyReLU),
        Just(Activation::Tanh),
        Just(Activation::Sigmoid),
        Just(Activation::Softmax),
    ]
}

proptest! {
    #[test]
    fn threat_level_bands(score in -10.0f32..200.0) {
        let expected = if score >= 60.0 {
            ThreatLevel::Critical
        } else if score >= 40.0 {
            ThreatLevel::High
        } else if score >= 20.0 {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        };
        prop_assert_eq!(ThreatLevel::from_score(score), expected);
    }

    #[test]
    fn protection_stays_in_unit_range(
        kind in cover_type(),
        normal_yaw in -180.0f32..180.0,
        blocked in 0.0f32..=1.0,
        tx in -2000.0f32..2000.0,
        ty in -2000.0f32..2000.0,
        tz in -200.0f32..200.0,
    ) {
        let point = CoverPoint::new(Vec3::ZERO, Vec3::from_yaw(normal_yaw), kind, blocked);
        let p = calculate_protection(&point, Vec3::new(tx, ty, tz));
        prop_assert!((0.0..=1.0).contains(&p), "protection {} out of range", p);
    }

    #[test]
    fn advantages_normalize_to_unit_variance(values in prop::collection::vec(-100.0f32..100.0, 2..64)) {
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let spread = values.iter().map(|v| (v - mean).abs()).fold(0.0f32, f32::max);
        prop_assume!(spread > 1e-2);

        let mut adv = values.clone();
        normalize_advantages(&mut adv);
        let n = adv.len() as f32;
        let m = adv.iter().sum::<f32>() / n;
        let var = adv.iter().map(|a| (a - m) * (a - m)).sum::<f32>() / n;
        prop_assert!(m.abs() < 1e-3, "mean {}", m);
        prop_assert!((var - 1.0).abs() < 1e-2, "variance {}", var);
    }

    #[test]
    fn skill_stays_clamped_after_adjustment(
        initial in 0.0f32..=1.0,
        kd in 0.0f32..10.0,
        accuracy in 0.0f32..=1.0,
        death_streak in 0u32..10,
        wins in 0u32..20,
        losses in 0u32..20,
        gap in -5.0f32..5.0,
        trend in -2.0f32..2.0,
    ) {
        let mut profile = SkillProfile::new(initial);
        profile.performance_gap = gap;
        profile.performance_trend = trend;
        let mut state = AdaptationState {
            recent_kd_ratio: kd,
            recent_accuracy: accuracy,
            death_streak,
            wins,
            losses,
            ..Default::default()
        };
        for round in 0..5 {
            adjust_difficulty(&mut profile, &mut state, round as f32 * 31.0);
            let (lo, hi) = (profile.min_skill, profile.max_skill);
            let c = profile.components;
            for v in [
                profile.current_skill,
                profile.target_skill,
                c.aim,
                c.movement,
                c.tactical,
                c.reaction,
                c.prediction,
                c.resource_management,
                c.teamwork,
            ] {
                prop_assert!((lo..=hi).contains(&v), "{} outside [{}, {}]", v, lo, hi);
            }
        }
    }

    #[test]
    fn network_output_matches_last_layer(
        input in 1usize..12,
        hidden in prop::collection::vec((1usize..16, activation()), 0..3),
        output in 1usize..8,
        out_act in activation(),
        seed in any::<u64>(),
    ) {
        let mut specs: Vec<LayerSpec> = hidden.iter().map(|(n, a)| LayerSpec::new(*n, *a)).collect();
        specs.push(LayerSpec::new(output, out_act));
        let net = NeuralNetwork::new(input, &specs, &mut StdRng::seed_from_u64(seed)).expect("network");

        let x: Vec<f32> = (0..input).map(|i| (i as f32 * 0.37).sin()).collect();
        let a = net.predict(&x).expect("predict");
        let b = net.predict(&x).expect("predict");
        prop_assert_eq!(a.len(), output);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn memory_confidence_never_rises(steps in prop::collection::vec(0.0f32..2.0, 1..12)) {
        let mut world = BrushWorld::arena(1024.0, 256.0);
        let me = world.spawn(standing_player(0, 0.0, 0.0, Team::Red));
        let enemy = world.spawn(standing_player(0, 400.0, 0.0, Team::Blue));
        let mut p = PerceptionSystem::default();
        p.update(&world, me, &mut StdRng::seed_from_u64(1));
        prop_assume!(p.recall(enemy).is_some());

        let mut now = world.time();
        let mut last = 1.0f32;
        for dt in steps {
            now += dt;
            p.decay_memory(now);
            match p.recall(enemy) {
                Some(m) => {
                    prop_assert!(m.confidence <= last + 1e-6);
                    prop_assert!(m.confidence >= 0.1);
                    prop_assert!(now - m.last_seen <= 10.0);
                    last = m.confidence;
                }
                // Once forgotten it stays forgotten
                None => last = 0.0,
            }
        }
    }
}
