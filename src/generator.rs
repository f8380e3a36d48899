use tch::{nn, nn::ModuleT, Tensor};

use crate::check;
use crate::config::{ModelConfig, FRAME_SIZE, TERMINAL_SIZE};
use crate::error::{Error, Result};

/// Synthesizes clips of shape `[nc, T, 96, 96]` from a latent and a class
/// label. Every frame is decoded from its own fused latent by a 2D
/// deconvolution stack; frames are regrouped into clips on the way out.
#[derive(Debug)]
pub struct ClipGenerator {
    label_net: nn::SequentialT,
    combine: nn::Linear,
    net: nn::SequentialT,
    nc: i64,
    nz: i64,
    time_steps: i64,
    num_classes: i64,
}

impl ClipGenerator {
    pub fn new(path: nn::Path, config: &ModelConfig) -> Result<ClipGenerator> {
        config.validate()?;
        let (nc, ngf, nz, time_steps) = (config.nc, config.ngf, config.nz, config.time_steps);
        let embedding_dim = config.generator_embedding_dim();

        let label_net = nn::seq_t()
            .add(nn::embedding(&path / "Embedding", config.num_classes, embedding_dim, Default::default()))
            .add(nn::linear(&path / "label_Linear", embedding_dim, nz, Default::default()))
            .add_fn(|x| x.relu());

        // T frame latents plus the label vector, projected back down to T frame latents.
        let combine = nn::linear(&path / "combine_Linear", time_steps + 1, time_steps, Default::default());

        let up = || nn::ConvTransposeConfig { stride: 2, padding: 1, dilation: 1, bias: false, ..Default::default() };
        let net = nn::seq_t()
            .add(nn::conv_transpose2d(&path / "ConvTranspose2d_1", nz, ngf * 8,
                                        TERMINAL_SIZE, nn::ConvTransposeConfig { stride: 1, padding: 0, dilation: 1, bias: false, ..Default::default() }))
            .add(nn::batch_norm2d(&path / "batch_norm2d_1", ngf * 8, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::conv_transpose2d(&path / "ConvTranspose2d_2", ngf * 8, ngf * 4, 4, up()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_2", ngf * 4, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::conv_transpose2d(&path / "ConvTranspose2d_3", ngf * 4, ngf * 2, 4, up()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_3", ngf * 2, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::conv_transpose2d(&path / "ConvTranspose2d_4", ngf * 2, ngf, 4, up()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_4", ngf, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::conv_transpose2d(&path / "ConvTranspose2d_5", ngf, nc, 4, up()))
            .add_fn(|x| x.tanh());

        Ok(ClipGenerator {
            label_net,
            combine,
            net,
            nc,
            nz,
            time_steps,
            num_classes: config.num_classes,
        })
    }

    pub fn time_steps(&self) -> i64 {
        self.time_steps
    }

    pub fn latent_dim(&self) -> i64 {
        self.nz
    }

    /// Generates clips from `latents` conditioned on `labels`.
    ///
    /// `latents` is one of
    /// - `[nz]`: a single clip, `labels` a scalar; returns `[nc, T, 96, 96]`,
    /// - `[batch, nz]`: one latent per clip, repeated over every frame,
    /// - `[batch, T, nz]`: one latent per frame, e.g. a frame sequencer's
    ///   output moved to batch-first order.
    ///
    /// Batched inputs return `[batch, nc, T, 96, 96]`.
    pub fn forward_t(&self, latents: &Tensor, labels: &Tensor, train: bool) -> Result<Tensor> {
        check::like_param(latents, &self.combine.ws, "latents")?;
        let (t, nz) = (self.time_steps, self.nz);
        let (frame_latents, had_batch) = match latents.size().as_slice() {
            &[n] if n == nz => (latents.reshape([1, 1, nz]).expand([1, t, nz], false), false),
            &[b, n] if n == nz && b > 0 => (latents.unsqueeze(1).expand([b, t, nz], false), true),
            &[b, s, n] if n == nz && s == t && b > 0 => (latents.shallow_clone(), true),
            other => {
                return Err(Error::contract(format!(
                    "latents: expected [{nz}], [batch, {nz}] or [batch, {t}, {nz}], got {:?}",
                    other
                )))
            }
        };
        let batch = frame_latents.size()[0];
        let labels = check::labels(labels, batch, self.num_classes, self.combine.ws.device())?;

        // [batch, 1, nz] label vector joins the frame axis, then the frame
        // axis is projected back to T.
        let label_latent = self.label_net.forward_t(&labels, train).unsqueeze(1);
        let fused = Tensor::cat(&[frame_latents, label_latent], 1)
            .transpose(1, 2)
            .apply(&self.combine)
            .transpose(1, 2)
            .contiguous()
            .view([batch * t, nz, 1, 1]);

        let clips = self
            .net
            .forward_t(&fused, train)
            .view([batch, t, self.nc, FRAME_SIZE, FRAME_SIZE])
            .permute([0, 2, 1, 3, 4])
            .contiguous();
        Ok(if had_batch { clips } else { clips.squeeze_dim(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{kind, Device, Kind};

    fn small_config() -> ModelConfig {
        ModelConfig { ngf: 4, ..Default::default() }
    }

    #[test]
    fn batched_latents_produce_bounded_clips() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = ClipGenerator::new(vs.root(), &small_config()).unwrap();
        let latents = Tensor::randn([2, 60], kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[1i64, 101]);
        let clips = generator.forward_t(&latents, &labels, true).unwrap();
        assert_eq!(clips.size(), [2, 3, 16, 96, 96]);
        assert!(clips.min().double_value(&[]) >= -1.0);
        assert!(clips.max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn per_frame_latents_are_accepted() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = ClipGenerator::new(vs.root(), &small_config()).unwrap();
        let latents = Tensor::randn([3, 16, 60], kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[4i64, 5, 6]);
        let clips = generator.forward_t(&latents, &labels, false).unwrap();
        assert_eq!(clips.size(), [3, 3, 16, 96, 96]);
        assert_eq!(clips.kind(), Kind::Float);
    }

    #[test]
    fn label_changes_the_clip() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = ClipGenerator::new(vs.root(), &small_config()).unwrap();
        let latent = Tensor::randn([60], kind::FLOAT_CPU);
        let a = generator.forward_t(&latent, &Tensor::from(2i64), false).unwrap();
        let b = generator.forward_t(&latent, &Tensor::from(90i64), false).unwrap();
        assert_eq!(a.size(), [3, 16, 96, 96]);
        let diff = (a - b).abs().max().double_value(&[]);
        assert!(diff > 0.0);
    }

    #[test]
    fn latents_must_match_parameter_kind() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = ClipGenerator::new(vs.root(), &small_config()).unwrap();
        let latents = Tensor::zeros([2, 60], (Kind::Double, Device::Cpu));
        let labels = Tensor::from_slice(&[1i64, 2]);
        assert!(matches!(
            generator.forward_t(&latents, &labels, false),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn wrong_latent_width_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let generator = ClipGenerator::new(vs.root(), &small_config()).unwrap();
        let latents = Tensor::randn([2, 59], kind::FLOAT_CPU);
        let labels = Tensor::from_slice(&[1i64, 2]);
        assert!(matches!(
            generator.forward_t(&latents, &labels, false),
            Err(Error::ContractViolation(_))
        ));
        let latents = Tensor::randn([2, 8, 60], kind::FLOAT_CPU);
        assert!(matches!(
            generator.forward_t(&latents, &labels, false),
            Err(Error::ContractViolation(_))
        ));
    }
}
