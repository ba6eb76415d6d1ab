//! ONNX Runtime session construction shared by the detector and the embedding models.

use crate::types::Device;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use std::path::Path;

const INTRA_THREADS: usize = 2;

/// Build a session for `model_path` bound to `device`.
///
/// The accelerator provider is registered with `error_on_failure` so an
/// unusable accelerator is a load error instead of a silent CPU fallback.
pub(crate) fn open_session(model_path: &Path, device: Device) -> ort::Result<Session> {
    let builder = Session::builder()?.with_intra_threads(INTRA_THREADS)?;

    let builder = match device {
        Device::Cpu => builder,
        Device::Accelerator => builder.with_execution_providers([CUDAExecutionProvider::default()
            .build()
            .error_on_failure()])?,
    };

    let session = builder.commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        %device,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "opened ONNX session"
    );

    Ok(session)
}
