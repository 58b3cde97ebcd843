use crate::{
    engine::task_call::{ComponentTaskCall, SingleTaskCall},
    envelope::{ExceptionProxy, ResultEnvelope},
    executors::{run_guarded, Work},
};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, instrument};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Unknown work kind '{0}'")]
    UnknownKind(String),
    #[error("Failed to encode the result")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to write {path}: {source}")]
    Output { path: PathBuf, source: io::Error },
}

/// A unit as written by the submitting side
#[derive(Serialize)]
#[serde(bound(serialize = "W: Work"))]
pub struct UnitCallRef<'a, W: Work> {
    pub work: &'a W,
    pub input: &'a W::Input,
}

/// A unit as read by the worker
#[derive(Deserialize)]
#[serde(bound(deserialize = "W: Work"))]
pub struct UnitCall<W: Work> {
    pub work: W,
    pub input: W::Input,
}

/// Load a serialized unit, run it and write its envelope
///
/// Failures of the unit itself end up in the envelope. A unit that can't even be loaded is
/// reported as an infrastructure failure, so only a failing output write is returned as error.
#[instrument(skip_all, fields(work = W::NAME, input = %input_file.display()))]
pub fn run_unit<W: Work>(input_file: &Path, output_file: &Path) -> Result<(), WorkerError> {
    let call = fs::read(input_file)
        .map_err(|error| error.to_string())
        .and_then(|content| {
            serde_json::from_slice::<UnitCall<W>>(&content).map_err(|error| error.to_string())
        });

    let envelope: ResultEnvelope<W::Output> = match call {
        Ok(call) => {
            debug!("Running unit");
            run_guarded(&call.work, call.input).into()
        }
        Err(reason) => {
            error!("Failed to load unit: {reason}");

            ResultEnvelope::Failure {
                proxy: ExceptionProxy::job(format!(
                    "Failed to load unit from {}: {reason}",
                    input_file.display()
                )),
            }
        }
    };

    let content = serde_json::to_vec(&envelope)?;

    write_atomically(output_file, &content).map_err(|source| WorkerError::Output {
        path: output_file.to_path_buf(),
        source,
    })
}

/// file an output is written to before it is renamed into place
pub fn temporary_path(path: &Path) -> PathBuf {
    let mut temporary = OsString::from(path.as_os_str());
    temporary.push(".tmp");
    PathBuf::from(temporary)
}

/// write next to the target and rename, readers never observe a partial file
pub fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let temporary = temporary_path(path);

    fs::write(&temporary, content)?;
    fs::rename(&temporary, path)
}

/// entry point of the `worker` subcommand, selects the unit type by its name
pub fn dispatch(kind: &str, input_file: &Path, output_file: &Path) -> Result<(), WorkerError> {
    if kind == SingleTaskCall::NAME {
        run_unit::<SingleTaskCall>(input_file, output_file)
    } else if kind == ComponentTaskCall::NAME {
        run_unit::<ComponentTaskCall>(input_file, output_file)
    } else {
        Err(WorkerError::UnknownKind(kind.to_string()))
    }
}
