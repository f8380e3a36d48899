//! Recurrent roll-out of per-frame latent codes.

use tch::{nn, Device, Kind, Tensor};

use crate::check;
use crate::error::{Error, Result};

const BATCH_NORM_MOMENTUM: f64 = 0.1;
const BATCH_NORM_EPS: f64 = 1e-5;

/// Gated recurrent cell. Gate rows are laid out as (reset, update, new).
///
/// `nn::gru` keeps its weights inside the libtorch RNN call and hands out no
/// per-gate tensors, so the cell owns them here for the update-gate bias
/// slices set by [`FrameSequencer::init_weights`].
#[derive(Debug)]
pub struct GruCell {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
    hidden_size: i64,
}

impl GruCell {
    pub fn new(path: nn::Path, input_size: i64, hidden_size: i64) -> GruCell {
        let gates = 3 * hidden_size;
        // Real values are assigned by FrameSequencer::init_weights.
        let w_ih = path.zeros("weight_ih", &[gates, input_size]);
        let w_hh = path.zeros("weight_hh", &[gates, hidden_size]);
        let b_ih = path.zeros("bias_ih", &[gates]);
        let b_hh = path.zeros("bias_hh", &[gates]);
        GruCell { w_ih, w_hh, b_ih, b_hh, hidden_size }
    }

    pub fn step(&self, input: &Tensor, hx: &Tensor) -> Tensor {
        let gi = input.matmul(&self.w_ih.tr()) + &self.b_ih;
        let gh = hx.matmul(&self.w_hh.tr()) + &self.b_hh;
        let h = self.hidden_size;

        let reset_gate = (gi.narrow(1, 0, h) + gh.narrow(1, 0, h)).sigmoid();
        let update_gate = (gi.narrow(1, h, h) + gh.narrow(1, h, h)).sigmoid();
        let new_gate = (gi.narrow(1, 2 * h, h) + reset_gate * gh.narrow(1, 2 * h, h)).tanh();

        // h' = (1 - z) * n + z * h
        &new_gate + update_gate * (hx - &new_gate)
    }
}

/// Parameter groups visited by [`FrameSequencer::init_weights`]. Each entry
/// shares storage with the registered variable.
#[derive(Debug)]
pub enum ParamGroup {
    Weight(Tensor),
    /// Input-to-hidden gate biases, `[3 * hidden]`.
    InputBias(Tensor),
    /// Hidden-to-hidden gate biases, `[3 * hidden]`.
    HiddenBias(Tensor),
    /// Any bias outside the recurrent cell.
    Bias(Tensor),
}

/// Produces a sequence of per-frame codes from an initial code.
///
/// The hidden state exists only between [`initialize`](Self::initialize) and
/// the end of the following [`forward_t`](Self::forward_t) call.
#[derive(Debug)]
pub struct FrameSequencer {
    cell: GruCell,
    projection: nn::Linear,
    running_mean: Tensor,
    running_var: Tensor,
    dropout: f64,
    input_size: i64,
    hidden_size: i64,
    device: Device,
    hidden: Option<Tensor>,
}

impl FrameSequencer {
    /// Builds the sequencer and runs the weight initialization with
    /// `forget_bias` on the update gates.
    pub fn new(
        path: nn::Path,
        input_size: i64,
        hidden_size: i64,
        dropout: f64,
        forget_bias: f64,
    ) -> Result<FrameSequencer> {
        if input_size <= 0 || hidden_size <= 0 {
            return Err(Error::config(format!(
                "sequencer widths must be positive, got input {input_size}, hidden {hidden_size}"
            )));
        }
        if !(0.0..1.0).contains(&dropout) {
            return Err(Error::config(format!("dropout must lie in [0, 1), got {dropout}")));
        }

        let cell = GruCell::new(&path / "gru", input_size, hidden_size);
        let projection = nn::linear(&path / "linear", hidden_size, input_size, Default::default());
        let running_mean = path.zeros_no_train("bn_running_mean", &[input_size]);
        let running_var = path.ones_no_train("bn_running_var", &[input_size]);

        let mut sequencer = FrameSequencer {
            cell,
            projection,
            running_mean,
            running_var,
            dropout,
            input_size,
            hidden_size,
            device: path.device(),
            hidden: None,
        };
        sequencer.init_weights(forget_bias);
        Ok(sequencer)
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    pub fn output_size(&self) -> i64 {
        self.input_size
    }

    pub fn is_ready(&self) -> bool {
        self.hidden.is_some()
    }

    pub fn param_groups(&self) -> Vec<ParamGroup> {
        let mut groups = vec![
            ParamGroup::Weight(self.cell.w_ih.shallow_clone()),
            ParamGroup::Weight(self.cell.w_hh.shallow_clone()),
            ParamGroup::Weight(self.projection.ws.shallow_clone()),
            ParamGroup::InputBias(self.cell.b_ih.shallow_clone()),
            ParamGroup::HiddenBias(self.cell.b_hh.shallow_clone()),
        ];
        if let Some(bs) = &self.projection.bs {
            groups.push(ParamGroup::Bias(bs.shallow_clone()));
        }
        groups
    }

    /// Xavier-uniform weights; update-gate slices of both cell biases set to
    /// `forget_bias`; every other bias zeroed.
    pub fn init_weights(&mut self, forget_bias: f64) {
        let h = self.hidden_size;
        tch::no_grad(|| {
            for group in self.param_groups() {
                match group {
                    ParamGroup::Weight(mut ws) => {
                        let (fan_out, fan_in) = (ws.size()[0], ws.size()[1]);
                        let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                        let _ = ws.uniform_(-bound, bound);
                    }
                    ParamGroup::InputBias(mut bs) | ParamGroup::HiddenBias(mut bs) => {
                        let _ = bs.zero_();
                        let _ = bs.narrow(0, h, h).fill_(forget_bias);
                    }
                    ParamGroup::Bias(mut bs) => {
                        let _ = bs.zero_();
                    }
                }
            }
        });
    }

    /// Zeroes the hidden state for a new sequence of `batch_size` codes.
    pub fn initialize(&mut self, batch_size: i64) -> Result<()> {
        if self.hidden.is_some() {
            return Err(Error::UsageSequence(
                "sequencer already initialized; finish or reset the pending sequence first".into(),
            ));
        }
        if batch_size <= 0 {
            return Err(Error::contract(format!("batch size must be positive, got {batch_size}")));
        }
        self.hidden = Some(Tensor::zeros(
            [batch_size, self.hidden_size],
            (Kind::Float, self.device),
        ));
        Ok(())
    }

    /// Discards a pending sequence without running it.
    pub fn reset(&mut self) {
        self.hidden = None;
    }

    /// Rolls `inputs` (`[batch, input_size]`) forward for `n_frames` steps and
    /// returns the normalized codes as `[n_frames, batch, input_size]`.
    /// Consumes the hidden state set by [`initialize`](Self::initialize).
    pub fn forward_t(&mut self, inputs: &Tensor, n_frames: i64, train: bool) -> Result<Tensor> {
        let mut hidden = match &self.hidden {
            Some(hidden) => hidden.shallow_clone(),
            None => {
                return Err(Error::UsageSequence(
                    "sequencer stepped before initialize".into(),
                ))
            }
        };
        check::like_param(inputs, &self.cell.w_ih, "sequencer inputs")?;
        let batch = hidden.size()[0];
        if inputs.size() != [batch, self.input_size] {
            return Err(Error::contract(format!(
                "sequencer inputs: expected [{batch}, {}], got {:?}",
                self.input_size,
                inputs.size()
            )));
        }
        if n_frames <= 0 {
            return Err(Error::contract(format!("n_frames must be positive, got {n_frames}")));
        }
        self.hidden = None;

        let mut code = inputs.shallow_clone();
        let mut outputs = Vec::with_capacity(n_frames as usize);
        for _ in 0..n_frames {
            hidden = self.cell.step(&code, &hidden);
            code = hidden.dropout(self.dropout, train).apply(&self.projection);
            outputs.push(code.shallow_clone());
        }

        let outputs = outputs
            .iter()
            .map(|code| self.normalize(code, train))
            .collect::<Vec<_>>();
        Ok(Tensor::stack(&outputs, 0))
    }

    /// Batch norm without affine terms; training mode uses the statistics of
    /// this single frame's batch.
    fn normalize(&self, code: &Tensor, train: bool) -> Tensor {
        Tensor::batch_norm(
            code,
            None::<&Tensor>,
            None::<&Tensor>,
            Some(&self.running_mean),
            Some(&self.running_var),
            train,
            BATCH_NORM_MOMENTUM,
            BATCH_NORM_EPS,
            false,
        )
    }
}
