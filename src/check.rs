//! Call-time validation of input tensors.

use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

/// Ensures `xs` is either `unbatched` (exactly `dims`) or batched (a leading
/// batch axis followed by `dims`). Returns the batched view and whether the
/// input carried a batch axis.
pub(crate) fn batched(xs: &Tensor, dims: &[i64], what: &str) -> Result<(Tensor, bool)> {
    let size = xs.size();
    if size.as_slice() == dims {
        return Ok((xs.unsqueeze(0), false));
    }
    if size.len() == dims.len() + 1 && &size[1..] == dims {
        if size[0] == 0 {
            return Err(Error::contract(format!("{what}: empty batch")));
        }
        return Ok((xs.shallow_clone(), true));
    }
    Err(Error::contract(format!(
        "{what}: expected shape {:?} or [batch, {}], got {:?}",
        dims,
        dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", "),
        size
    )))
}

/// Ensures `xs` has the kind and device of the layer parameter `param`.
pub(crate) fn like_param(xs: &Tensor, param: &Tensor, what: &str) -> Result<()> {
    if xs.kind() != param.kind() {
        return Err(Error::contract(format!(
            "{what}: expected {:?} to match the parameters, got {:?}",
            param.kind(),
            xs.kind()
        )));
    }
    if xs.device() != param.device() {
        return Err(Error::contract(format!(
            "{what}: expected a tensor on {:?}, got {:?}",
            param.device(),
            xs.device()
        )));
    }
    Ok(())
}

/// Normalizes labels to a rank-1 `Int64` tensor of length `batch` on `device`
/// and checks every entry lies in `[0, num_classes)`.
pub(crate) fn labels(labels: &Tensor, batch: i64, num_classes: i64, device: Device) -> Result<Tensor> {
    if labels.kind() != Kind::Int64 {
        return Err(Error::contract(format!(
            "labels: expected Int64, got {:?}",
            labels.kind()
        )));
    }
    if labels.device() != device {
        return Err(Error::contract(format!(
            "labels: expected a tensor on {:?}, got {:?}",
            device,
            labels.device()
        )));
    }
    let labels = match labels.dim() {
        0 => labels.reshape([1]),
        1 => labels.shallow_clone(),
        rank => {
            return Err(Error::contract(format!(
                "labels: expected rank 0 or 1, got rank {rank}"
            )))
        }
    };
    let count = labels.size()[0];
    if count != batch {
        return Err(Error::contract(format!(
            "labels: expected {batch} labels, got {count}"
        )));
    }
    let lo = labels.min().int64_value(&[]);
    let hi = labels.max().int64_value(&[]);
    if lo < 0 || hi >= num_classes {
        return Err(Error::contract(format!(
            "labels: values must lie in [0, {num_classes}), got range [{lo}, {hi}]"
        )));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_accepts_both_forms() {
        let frame = Tensor::zeros([3, 4, 4], tch::kind::FLOAT_CPU);
        let (xs, had_batch) = batched(&frame, &[3, 4, 4], "frame").unwrap();
        assert_eq!(xs.size(), [1, 3, 4, 4]);
        assert!(!had_batch);

        let frames = Tensor::zeros([2, 3, 4, 4], tch::kind::FLOAT_CPU);
        let (xs, had_batch) = batched(&frames, &[3, 4, 4], "frame").unwrap();
        assert_eq!(xs.size(), [2, 3, 4, 4]);
        assert!(had_batch);

        let wrong = Tensor::zeros([2, 1, 4, 4], tch::kind::FLOAT_CPU);
        assert!(matches!(
            batched(&wrong, &[3, 4, 4], "frame"),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn inputs_follow_parameter_kind() {
        let param = Tensor::zeros([4, 4], tch::kind::FLOAT_CPU);
        let xs = Tensor::zeros([2, 4], tch::kind::FLOAT_CPU);
        like_param(&xs, &param, "xs").unwrap();

        let double = Tensor::zeros([2, 4], (Kind::Double, Device::Cpu));
        assert!(matches!(like_param(&double, &param, "xs"), Err(Error::ContractViolation(_))));
        let ints = Tensor::zeros([2, 4], tch::kind::INT64_CPU);
        assert!(matches!(like_param(&ints, &param, "xs"), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn labels_out_of_range() {
        let ok = Tensor::from_slice(&[0i64, 9]);
        assert_eq!(labels(&ok, 2, 10, Device::Cpu).unwrap().size(), [2]);
        let scalar = Tensor::from(3i64);
        assert_eq!(labels(&scalar, 1, 10, Device::Cpu).unwrap().size(), [1]);

        let high = Tensor::from_slice(&[0i64, 10]);
        assert!(matches!(labels(&high, 2, 10, Device::Cpu), Err(Error::ContractViolation(_))));
        let negative = Tensor::from_slice(&[-1i64]);
        assert!(matches!(labels(&negative, 1, 10, Device::Cpu), Err(Error::ContractViolation(_))));
        let float = Tensor::from_slice(&[1.0f32]);
        assert!(matches!(labels(&float, 1, 10, Device::Cpu), Err(Error::ContractViolation(_))));
        assert!(matches!(labels(&ok, 3, 10, Device::Cpu), Err(Error::ContractViolation(_))));
    }
}
