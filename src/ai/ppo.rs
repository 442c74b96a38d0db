//! PPO learning agent
//!
//! Actor (softmax policy) and critic (state value) networks trained online
//! from a bounded trajectory buffer. Advantages come from GAE and the
//! policy ratio uses the probability of the action that was actually taken.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ai::constants::ppo::{
    ACTOR_LEARNING_RATE, BATCH_SIZE, CLIP_EPSILON, CRITIC_LEARNING_RATE, ENTROPY_COEFFICIENT,
    EPOCHS, GAMMA, LAMBDA, REPLAY_CAPACITY, TARGET_TAU, TARGET_UPDATE_INTERVAL,
    TRAJECTORY_CAPACITY, UPDATE_FREQUENCY, VALUE_COEFFICIENT,
};
use crate::ai::neural::{Activation, LayerSpec, NetworkError, NeuralNetwork};
use crate::util::ring::RingBuffer;

/// Reward split by source, summed for training
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub combat: f32,
    pub survival: f32,
    pub objective: f32,
    pub movement: f32,
}

impl RewardBreakdown {
    #[inline]
    pub fn total(&self) -> f32 {
        self.combat + self.survival + self.objective + self.movement
    }
}

/// One environment step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f32>,
    pub action: usize,
    pub reward: RewardBreakdown,
    pub value: f32,
    pub log_prob: f32,
    pub advantage: f32,
    pub returns: f32,
    pub done: bool,
}

/// Training hyperparameters
#[derive(Debug, Clone)]
pub struct PpoConfig {
    pub update_frequency: usize,
    pub trajectory_capacity: usize,
    pub replay_capacity: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub gamma: f32,
    pub lambda: f32,
    pub clip_epsilon: f32,
    pub value_coefficient: f32,
    pub entropy_coefficient: f32,
    pub actor_learning_rate: f32,
    pub critic_learning_rate: f32,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            update_frequency: UPDATE_FREQUENCY,
            trajectory_capacity: TRAJECTORY_CAPACITY,
            replay_capacity: REPLAY_CAPACITY,
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            gamma: GAMMA,
            lambda: LAMBDA,
            clip_epsilon: CLIP_EPSILON,
            value_coefficient: VALUE_COEFFICIENT,
            entropy_coefficient: ENTROPY_COEFFICIENT,
            actor_learning_rate: ACTOR_LEARNING_RATE,
            critic_learning_rate: CRITIC_LEARNING_RATE,
        }
    }
}

/// Sampled policy output
#[derive(Debug, Clone)]
pub struct ActionSample {
    pub action: usize,
    pub log_prob: f32,
    pub value: f32,
    pub probabilities: Vec<f32>,
}

/// Summary of one training call
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingStats {
    pub samples: usize,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    pub clip_fraction: f32,
}

/// Generalized Advantage Estimation, walking the trajectory backward.
///
/// `last_value` bootstraps the state after the final step and is ignored
/// when that step is terminal.
pub fn compute_gae(experiences: &mut [Experience], last_value: f32, gamma: f32, lambda: f32) {
    let mut gae = 0.0;
    let mut next_value = last_value;
    for exp in experiences.iter_mut().rev() {
        let not_done = if exp.done { 0.0 } else { 1.0 };
        let delta = exp.reward.total() + gamma * next_value * not_done - exp.value;
        gae = delta + gamma * lambda * not_done * gae;
        exp.advantage = gae;
        exp.returns = gae + exp.value;
        next_value = exp.value;
    }
}

/// Shift to zero mean and scale to unit population variance.
/// Constant input only has its mean removed.
pub fn normalize_advantages(advantages: &mut [f32]) {
    if advantages.is_empty() {
        return;
    }
    let n = advantages.len() as f32;
    let mean = advantages.iter().sum::<f32>() / n;
    let var = advantages.iter().map(|a| (a - mean) * (a - mean)).sum::<f32>() / n;
    let std = var.sqrt();
    for a in advantages.iter_mut() {
        *a -= mean;
        if std > 1e-8 {
            *a /= std;
        }
    }
}

fn sample_index<R: Rng + ?Sized>(probabilities: &[f32], rng: &mut R) -> usize {
    let mut roll = rng.gen::<f32>();
    for (i, p) in probabilities.iter().enumerate() {
        if roll < *p {
            return i;
        }
        roll -= p;
    }
    probabilities.len().saturating_sub(1)
}

/// Actor-critic agent
#[derive(Debug, Clone)]
pub struct PpoAgent {
    actor: NeuralNetwork,
    critic: NeuralNetwork,
    target_critic: NeuralNetwork,
    trajectory: RingBuffer<Experience>,
    replay: RingBuffer<Experience>,
    config: PpoConfig,
    steps: u64,
    updates: u64,
    last_stats: Option<TrainingStats>,
}

impl PpoAgent {
    pub fn new<R: Rng + ?Sized>(
        state_size: usize,
        action_count: usize,
        hidden: &[usize],
        config: PpoConfig,
        rng: &mut R,
    ) -> Result<Self, NetworkError> {
        let mut actor_specs: Vec<LayerSpec> = hidden.iter().map(|&n| LayerSpec::new(n, Activation::ReLU)).collect();
        let mut critic_specs = actor_specs.clone();
        actor_specs.push(LayerSpec::new(action_count, Activation::Softmax));
        critic_specs.push(LayerSpec::new(1, Activation::Linear));

        let mut actor = NeuralNetwork::new(state_size, &actor_specs, rng)?;
        actor.set_learning_rate(config.actor_learning_rate);
        let mut critic = NeuralNetwork::new(state_size, &critic_specs, rng)?;
        critic.set_learning_rate(config.critic_learning_rate);
        let target_critic = critic.clone();

        Ok(Self {
            actor,
            critic,
            target_critic,
            trajectory: RingBuffer::new(config.trajectory_capacity),
            replay: RingBuffer::new(config.replay_capacity),
            config,
            steps: 0,
            updates: 0,
            last_stats: None,
        })
    }

    pub fn state_size(&self) -> usize {
        self.actor.input_size()
    }

    pub fn action_count(&self) -> usize {
        self.actor.output_size()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn trajectory_len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn last_stats(&self) -> Option<TrainingStats> {
        self.last_stats
    }

    pub fn actor(&self) -> &NeuralNetwork {
        &self.actor
    }

    pub fn critic(&self) -> &NeuralNetwork {
        &self.critic
    }

    /// Sample an action from the current policy
    pub fn select_action<R: Rng + ?Sized>(&self, state: &[f32], rng: &mut R) -> Result<ActionSample, NetworkError> {
        let probabilities = self.actor.predict(state)?;
        let value = self.critic.predict(state)?[0];
        let action = sample_index(&probabilities, rng);
        let log_prob = probabilities[action].max(1e-8).ln();
        Ok(ActionSample { action, log_prob, value, probabilities })
    }

    /// Value estimate from the slowly-moving target critic, used to bootstrap GAE
    pub fn bootstrap_value(&self, state: &[f32]) -> Result<f32, NetworkError> {
        Ok(self.target_critic.predict(state)?[0])
    }

    /// Record a step without training
    pub fn store(&mut self, experience: Experience) {
        self.replay.push(experience.clone());
        self.trajectory.push(experience);
    }

    /// Record a step and train every `update_frequency` steps
    pub fn step<R: Rng + ?Sized>(
        &mut self,
        experience: Experience,
        next_state: &[f32],
        rng: &mut R,
    ) -> Result<Option<TrainingStats>, NetworkError> {
        self.store(experience);
        self.steps += 1;
        if self.steps % self.config.update_frequency.max(1) as u64 != 0 {
            return Ok(None);
        }
        let last_value = self.bootstrap_value(next_state)?;
        self.train(last_value, rng)
    }

    /// Run PPO epochs over the stored trajectory, consuming it.
    /// Returns `None` when there is nothing to train on.
    pub fn train<R: Rng + ?Sized>(&mut self, last_value: f32, rng: &mut R) -> Result<Option<TrainingStats>, NetworkError> {
        if self.trajectory.is_empty() {
            return Ok(None);
        }
        let mut batch: Vec<Experience> = self.trajectory.drain().collect();
        compute_gae(&mut batch, last_value, self.config.gamma, self.config.lambda);

        let mut advantages: Vec<f32> = batch.iter().map(|e| e.advantage).collect();
        normalize_advantages(&mut advantages);
        for (exp, adv) in batch.iter_mut().zip(&advantages) {
            exp.advantage = *adv;
        }

        self.actor.set_training(true);
        self.critic.set_training(true);

        let mut stats = TrainingStats::default();
        let mut clipped = 0usize;
        let mut indices: Vec<usize> = (0..batch.len()).collect();
        let batch_size = self.config.batch_size.max(1);

        let result = (|| -> Result<(), NetworkError> {
            for _ in 0..self.config.epochs {
                indices.shuffle(rng);
                for chunk in indices.chunks(batch_size) {
                    for &i in chunk {
                        let exp = &batch[i];
                        let (policy_loss, entropy, was_clipped) = self.policy_step(exp, rng)?;
                        let value_loss = self.value_step(exp, rng)?;
                        stats.policy_loss += policy_loss;
                        stats.value_loss += value_loss;
                        stats.entropy += entropy;
                        stats.samples += 1;
                        clipped += usize::from(was_clipped);
                    }
                    self.actor.update_weights();
                    self.critic.update_weights();
                    self.updates += 1;
                    if self.updates % TARGET_UPDATE_INTERVAL == 0 {
                        self.target_critic.soft_update_from(&self.critic, TARGET_TAU)?;
                    }
                }
            }
            Ok(())
        })();

        self.actor.set_training(false);
        self.critic.set_training(false);
        result?;

        if stats.samples > 0 {
            let n = stats.samples as f32;
            stats.policy_loss /= n;
            stats.value_loss /= n;
            stats.entropy /= n;
            stats.clip_fraction = clipped as f32 / n;
        }
        info!(
            samples = batch.len(),
            updates = self.updates,
            policy_loss = stats.policy_loss,
            value_loss = stats.value_loss,
            entropy = stats.entropy,
            "PPO update complete"
        );
        self.last_stats = Some(stats);
        Ok(Some(stats))
    }

    /// Clipped surrogate gradient for the sampled action plus the entropy bonus
    fn policy_step<R: Rng + ?Sized>(&mut self, exp: &Experience, rng: &mut R) -> Result<(f32, f32, bool), NetworkError> {
        let probabilities = self.actor.forward(&exp.state, rng)?;
        let action = exp.action.min(probabilities.len().saturating_sub(1));
        let p = probabilities[action].max(1e-8);
        let ratio = (p.ln() - exp.log_prob).exp();
        let advantage = exp.advantage;

        let eps = self.config.clip_epsilon;
        let unclipped = ratio * advantage;
        let clipped = ratio.clamp(1.0 - eps, 1.0 + eps) * advantage;
        let policy_loss = -unclipped.min(clipped);
        // The clipped branch has zero gradient once it is the active minimum
        let was_clipped = clipped < unclipped;

        let entropy: f32 = -probabilities.iter().map(|&q| q * q.max(1e-8).ln()).sum::<f32>();

        // d(loss)/d(prob); loss = policy_loss - c_e * entropy
        let ce = self.config.entropy_coefficient;
        let mut grad: Vec<f32> = probabilities.iter().map(|&q| ce * (q.max(1e-8).ln() + 1.0)).collect();
        if !was_clipped {
            grad[action] += -advantage * ratio / p;
        }
        self.actor.backward_from_output_grad(&grad)?;
        Ok((policy_loss, entropy, was_clipped))
    }

    fn value_step<R: Rng + ?Sized>(&mut self, exp: &Experience, rng: &mut R) -> Result<f32, NetworkError> {
        let value = self.critic.forward(&exp.state, rng)?[0];
        let error = value - exp.returns;
        let c = self.config.value_coefficient;
        self.critic.backward_from_output_grad(&[2.0 * c * error])?;
        Ok(c * error * error)
    }

    /// Write actor and critic checkpoints as `<stem>.actor.bnn` / `<stem>.critic.bnn`
    pub fn save(&self, dir: &Path, stem: &str) -> Result<(), NetworkError> {
        self.actor.save(&dir.join(format!("{stem}.actor.bnn")))?;
        self.critic.save(&dir.join(format!("{stem}.critic.bnn")))?;
        Ok(())
    }

    /// Replace the networks with saved checkpoints of matching shape, keeping fresh weights otherwise
    pub fn load_checkpoints(&mut self, dir: &Path, stem: &str) {
        let actor = NeuralNetwork::load_or(&dir.join(format!("{stem}.actor.bnn")), self.actor.clone());
        let critic = NeuralNetwork::load_or(&dir.join(format!("{stem}.critic.bnn")), self.critic.clone());
        self.actor = actor;
        self.target_critic = critic.clone();
        self.critic = critic;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn exp(reward: f32, value: f32, done: bool) -> Experience {
        Experience {
            reward: RewardBreakdown { combat: reward, ..Default::default() },
            value,
            done,
            ..Default::default()
        }
    }

    fn small_config() -> PpoConfig {
        PpoConfig {
            update_frequency: 64,
            trajectory_capacity: 64,
            replay_capacity: 256,
            epochs: 4,
            batch_size: 16,
            actor_learning_rate: 0.01,
            critic_learning_rate: 0.01,
            ..PpoConfig::default()
        }
    }

    // ========================================================================
    // Advantage estimation
    // ========================================================================

    #[test]
    fn test_gae_single_terminal_step() {
        let mut t = vec![exp(1.0, 0.25, true)];
        compute_gae(&mut t, 100.0, 0.99, 0.95);
        assert!((t[0].advantage - 0.75).abs() < 1e-6);
        assert!((t[0].returns - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gae_bootstraps_and_accumulates() {
        let (gamma, lambda) = (0.9, 0.5);
        let mut t = vec![exp(1.0, 0.0, false), exp(0.0, 0.0, false)];
        compute_gae(&mut t, 2.0, gamma, lambda);
        // step 1: delta = 0 + 0.9 * 2 - 0 = 1.8
        assert!((t[1].advantage - 1.8).abs() < 1e-5);
        // step 0: delta = 1 + 0.9 * 0 - 0 = 1; gae = 1 + 0.45 * 1.8
        assert!((t[0].advantage - (1.0 + 0.45 * 1.8)).abs() < 1e-5);
    }

    #[test]
    fn test_gae_done_cuts_episode() {
        let mut t = vec![exp(1.0, 0.0, true), exp(5.0, 0.0, false)];
        compute_gae(&mut t, 0.0, 0.99, 0.95);
        assert!((t[0].advantage - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_advantages() {
        let mut adv = vec![1.0, 2.0, 3.0, 10.0];
        normalize_advantages(&mut adv);
        let n = adv.len() as f32;
        let mean = adv.iter().sum::<f32>() / n;
        let var = adv.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);

        let mut flat = vec![3.0; 5];
        normalize_advantages(&mut flat);
        assert!(flat.iter().all(|a| a.abs() < 1e-6));
    }

    // ========================================================================
    // Agent
    // ========================================================================

    #[test]
    fn test_select_action_is_consistent() {
        let mut rng = StdRng::seed_from_u64(3);
        let agent = PpoAgent::new(4, 3, &[8], PpoConfig::default(), &mut rng).unwrap();
        let sample = agent.select_action(&[0.1, 0.2, 0.3, 0.4], &mut rng).unwrap();
        assert!(sample.action < 3);
        assert!((sample.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((sample.log_prob - sample.probabilities[sample.action].ln()).abs() < 1e-5);
    }

    #[test]
    fn test_train_empty_returns_none() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut agent = PpoAgent::new(2, 2, &[4], small_config(), &mut rng).unwrap();
        assert!(agent.train(0.0, &mut rng).unwrap().is_none());
    }

    #[test]
    fn test_step_trains_on_schedule() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut agent = PpoAgent::new(2, 2, &[4], small_config(), &mut rng).unwrap();
        let state = vec![0.5, -0.5];
        for i in 0..64 {
            let sample = agent.select_action(&state, &mut rng).unwrap();
            let e = Experience {
                state: state.clone(),
                action: sample.action,
                value: sample.value,
                log_prob: sample.log_prob,
                ..Default::default()
            };
            let trained = agent.step(e, &state, &mut rng).unwrap();
            assert_eq!(trained.is_some(), i == 63);
        }
        assert_eq!(agent.trajectory_len(), 0);
        assert_eq!(agent.replay_len(), 64);
        // 64 samples / 16 per batch * 4 epochs
        assert_eq!(agent.updates(), 16);
    }

    #[test]
    fn test_policy_learns_rewarded_action() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut agent = PpoAgent::new(1, 2, &[8], small_config(), &mut rng).unwrap();
        let state = vec![1.0];
        let before = agent.actor().predict(&state).unwrap()[1];

        for _ in 0..20 {
            for _ in 0..64 {
                let sample = agent.select_action(&state, &mut rng).unwrap();
                let reward = if sample.action == 1 { 1.0 } else { 0.0 };
                let e = Experience {
                    state: state.clone(),
                    action: sample.action,
                    reward: RewardBreakdown { objective: reward, ..Default::default() },
                    value: sample.value,
                    log_prob: sample.log_prob,
                    done: true,
                    ..Default::default()
                };
                agent.step(e, &state, &mut rng).unwrap();
            }
        }

        let after = agent.actor().predict(&state).unwrap()[1];
        assert!(after > before);
        assert!(after > 0.6);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let agent = PpoAgent::new(3, 2, &[4], PpoConfig::default(), &mut rng).unwrap();
        agent.save(dir.path(), "bot").unwrap();

        let mut fresh = PpoAgent::new(3, 2, &[4], PpoConfig::default(), &mut rng).unwrap();
        fresh.load_checkpoints(dir.path(), "bot");
        let s = [0.3, 0.1, -0.4];
        assert_eq!(fresh.actor().predict(&s).unwrap(), agent.actor().predict(&s).unwrap());
        assert_eq!(fresh.critic().predict(&s).unwrap(), agent.critic().predict(&s).unwrap());
    }
}
