use tch::{nn, nn::ModuleT, Tensor};

use crate::check;
use crate::config::{ModelConfig, FRAME_SIZE, LEAKY_SLOPE, TERMINAL_SIZE};
use crate::error::Result;

fn leaky_relu(xs: &Tensor) -> Tensor {
    xs.maximum(&(xs * LEAKY_SLOPE))
}

fn down_conv() -> nn::ConvConfig {
    nn::ConvConfig { stride: 2, padding: 1, bias: false, ..Default::default() }
}

/// Scores single frames of shape `[nc, 96, 96]` (optionally batched).
#[derive(Debug)]
pub struct FrameDiscriminator {
    net: nn::SequentialT,
    /// First convolution's weight; inputs must share its kind and device.
    weight: Tensor,
    nc: i64,
}

impl FrameDiscriminator {
    pub fn new(path: nn::Path, config: &ModelConfig) -> Result<FrameDiscriminator> {
        config.validate()?;
        let (nc, ndf) = (config.nc, config.ndf);
        let conv1 = nn::conv2d(&path / "Conv2d_1", nc, ndf, 4, down_conv());
        let weight = conv1.ws.shallow_clone();
        // 96 -> 48 -> 24 -> 12 -> 6 -> 1
        let net = nn::seq_t()
            .add(conv1)
            .add_fn(leaky_relu)
            .add(nn::conv2d(&path / "Conv2d_2", ndf, ndf * 2, 4, down_conv()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_2", ndf * 2, Default::default()))
            .add_fn(leaky_relu)
            .add(nn::conv2d(&path / "Conv2d_3", ndf * 2, ndf * 4, 4, down_conv()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_3", ndf * 4, Default::default()))
            .add_fn(leaky_relu)
            .add(nn::conv2d(&path / "Conv2d_4", ndf * 4, ndf * 8, 4, down_conv()))
            .add(nn::batch_norm2d(&path / "batch_norm2d_4", ndf * 8, Default::default()))
            .add_fn(leaky_relu)
            .add(nn::conv2d(&path / "Conv2d_5", ndf * 8, 1,
                            TERMINAL_SIZE, nn::ConvConfig { stride: 1, padding: 0, bias: false, ..Default::default() }))
            .add_fn(|x| x.sigmoid());
        Ok(FrameDiscriminator { net, weight, nc })
    }

    /// Returns one realism score per frame: `[batch]` for batched input, a
    /// scalar for a single frame.
    pub fn forward_t(&self, frames: &Tensor, train: bool) -> Result<Tensor> {
        check::like_param(frames, &self.weight, "frames")?;
        let (xs, had_batch) = check::batched(frames, &[self.nc, FRAME_SIZE, FRAME_SIZE], "frames")?;
        let scores = self.net.forward_t(&xs, train).view([-1]);
        Ok(if had_batch { scores } else { scores.squeeze_dim(0) })
    }
}

/// Scores clips of shape `[nc, T, 96, 96]` (optionally batched) conditioned
/// on a class label.
#[derive(Debug)]
pub struct ClipDiscriminator {
    label_net: nn::SequentialT,
    net: nn::SequentialT,
    final_net: nn::SequentialT,
    weight: Tensor,
    nc: i64,
    time_steps: i64,
    num_classes: i64,
}

impl ClipDiscriminator {
    pub fn new(path: nn::Path, config: &ModelConfig) -> Result<ClipDiscriminator> {
        config.validate()?;
        let (nc, ndf) = (config.nc, config.ndf);
        let features = config.clip_feature_dim();
        let embedding_dim = config.discriminator_embedding_dim();

        let label_net = nn::seq_t()
            .add(nn::embedding(&path / "Embedding", config.num_classes, embedding_dim, Default::default()))
            .add(nn::linear(&path / "label_Linear", embedding_dim, features, Default::default()))
            .add_fn(leaky_relu);

        let conv1 = nn::conv3d(&path / "Conv3d_1", nc, ndf, 4, down_conv());
        let weight = conv1.ws.shallow_clone();
        // (T, 96, 96) -> (T/2, 48, 48) -> ... -> (T/16, 6, 6)
        let net = nn::seq_t()
            .add(conv1)
            .add_fn(leaky_relu)
            .add(nn::conv3d(&path / "Conv3d_2", ndf, ndf * 2, 4, down_conv()))
            .add(nn::batch_norm3d(&path / "batch_norm3d_2", ndf * 2, Default::default()))
            .add_fn(leaky_relu)
            .add(nn::conv3d(&path / "Conv3d_3", ndf * 2, ndf * 4, 4, down_conv()))
            .add(nn::batch_norm3d(&path / "batch_norm3d_3", ndf * 4, Default::default()))
            .add_fn(leaky_relu)
            .add(nn::conv3d(&path / "Conv3d_4", ndf * 4, ndf * 8, 4, down_conv()))
            .add(nn::batch_norm3d(&path / "batch_norm3d_4", ndf * 8, Default::default()))
            .add_fn(leaky_relu)
            .add_fn(|x| x.flatten(1, -1));

        let final_net = nn::seq_t()
            .add(nn::linear(&path / "final_Linear", features * 2, 1, Default::default()))
            .add_fn(|x| x.sigmoid());

        Ok(ClipDiscriminator {
            label_net,
            net,
            final_net,
            weight,
            nc,
            time_steps: config.time_steps,
            num_classes: config.num_classes,
        })
    }

    /// Returns one realism score per clip. `labels` holds one class index per
    /// clip, or a scalar for an unbatched clip.
    pub fn forward_t(&self, clips: &Tensor, labels: &Tensor, train: bool) -> Result<Tensor> {
        check::like_param(clips, &self.weight, "clips")?;
        let (xs, had_batch) = check::batched(
            clips,
            &[self.nc, self.time_steps, FRAME_SIZE, FRAME_SIZE],
            "clips",
        )?;
        let labels = check::labels(labels, xs.size()[0], self.num_classes, self.weight.device())?;

        let label_features = self.label_net.forward_t(&labels, train);
        let clip_features = self.net.forward_t(&xs, train);
        let scores = self
            .final_net
            .forward_t(&Tensor::cat(&[clip_features, label_features], 1), train)
            .view([-1]);
        Ok(if had_batch { scores } else { scores.squeeze_dim(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tch::{kind, Device};

    fn small_config() -> ModelConfig {
        ModelConfig { ndf: 4, ..Default::default() }
    }

    #[test]
    fn frame_scores_lie_in_unit_interval() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = FrameDiscriminator::new(vs.root(), &small_config()).unwrap();
        let frames = Tensor::randn([5, 3, 96, 96], kind::FLOAT_CPU);
        for train in [true, false] {
            let scores = discriminator.forward_t(&frames, train).unwrap();
            assert_eq!(scores.size(), [5]);
            assert!(scores.min().double_value(&[]) >= 0.0);
            assert!(scores.max().double_value(&[]) <= 1.0);
        }

        let single = discriminator.forward_t(&frames.get(0), false).unwrap();
        assert_eq!(single.dim(), 0);
    }

    #[test]
    fn frame_shape_mismatch_is_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = FrameDiscriminator::new(vs.root(), &small_config()).unwrap();
        let frames = Tensor::zeros([2, 1, 96, 96], kind::FLOAT_CPU);
        assert!(matches!(discriminator.forward_t(&frames, false), Err(Error::ContractViolation(_))));
        let frames = Tensor::zeros([2, 3, 64, 64], kind::FLOAT_CPU);
        assert!(matches!(discriminator.forward_t(&frames, false), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn frames_must_match_parameter_kind() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = FrameDiscriminator::new(vs.root(), &small_config()).unwrap();
        let frames = Tensor::zeros([1, 3, 96, 96], (tch::Kind::Double, Device::Cpu));
        assert!(matches!(discriminator.forward_t(&frames, false), Err(Error::ContractViolation(_))));
        let frames = Tensor::zeros([3, 96, 96], (tch::Kind::Half, Device::Cpu));
        assert!(matches!(discriminator.forward_t(&frames, false), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn clip_label_path_is_live() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = ClipDiscriminator::new(vs.root(), &small_config()).unwrap();

        let embedding = vs
            .variables()
            .remove("Embedding.weight")
            .expect("embedding weights registered");
        assert!(embedding.abs().sum(tch::Kind::Float).double_value(&[]) > 0.0);

        let clip = Tensor::randn([1, 3, 16, 96, 96], kind::FLOAT_CPU);
        let a = discriminator.forward_t(&clip, &Tensor::from_slice(&[3i64]), false).unwrap();
        let b = discriminator.forward_t(&clip, &Tensor::from_slice(&[40i64]), false).unwrap();
        assert_ne!(a.double_value(&[0]), b.double_value(&[0]));
    }

    #[test]
    fn clip_rejects_bad_labels_and_time_extent() {
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = ClipDiscriminator::new(vs.root(), &small_config()).unwrap();
        let clips = Tensor::zeros([2, 3, 16, 96, 96], kind::FLOAT_CPU);

        let out_of_range = Tensor::from_slice(&[1i64, 102]);
        assert!(matches!(
            discriminator.forward_t(&clips, &out_of_range, false),
            Err(Error::ContractViolation(_))
        ));
        let too_few = Tensor::from_slice(&[1i64]);
        assert!(matches!(
            discriminator.forward_t(&clips, &too_few, false),
            Err(Error::ContractViolation(_))
        ));
        let double = Tensor::zeros([2, 3, 16, 96, 96], (tch::Kind::Double, Device::Cpu));
        assert!(matches!(
            discriminator.forward_t(&double, &Tensor::from_slice(&[1i64, 2]), false),
            Err(Error::ContractViolation(_))
        ));
        let short = Tensor::zeros([2, 3, 8, 96, 96], kind::FLOAT_CPU);
        assert!(matches!(
            discriminator.forward_t(&short, &Tensor::from_slice(&[1i64, 2]), false),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn longer_clips_widen_the_trunk() {
        let config = ModelConfig { ndf: 2, time_steps: 32, num_classes: 64, ..Default::default() };
        let vs = nn::VarStore::new(Device::Cpu);
        let discriminator = ClipDiscriminator::new(vs.root(), &config).unwrap();
        let clips = Tensor::rand([2, 3, 32, 96, 96], kind::FLOAT_CPU);
        let scores = discriminator
            .forward_t(&clips, &Tensor::from_slice(&[0i64, 63]), true)
            .unwrap();
        assert_eq!(scores.size(), [2]);
    }

    #[test]
    fn invalid_time_extent_fails_at_construction() {
        let config = ModelConfig { time_steps: 12, ..small_config() };
        let vs = nn::VarStore::new(Device::Cpu);
        assert!(matches!(
            ClipDiscriminator::new(vs.root(), &config),
            Err(Error::Configuration(_))
        ));
    }
}
