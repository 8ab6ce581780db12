//! Parameter file loading
//!
//! Parameters are TOML files kept in `$RIG_SW_ROOT/params`. Executables give every parameter a
//! default, so a file only needs the values which differ on a particular rig.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::de::DeserializeOwned;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// An error that occurs during loading of a parameter file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("The software root environment variable (RIG_SW_ROOT) is not set")]
    SwRootNotSet,

    #[error("Cannot load the parameter file {0:?}: {1}")]
    FileLoadError(PathBuf, std::io::Error),

    #[error("Cannot read the parameter file: {0}")]
    DeserialiseError(toml::de::Error),
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Full path of a parameter file given relative to `$RIG_SW_ROOT/params`.
pub fn path(param_file_path: &str) -> Result<PathBuf, LoadError> {
    let root = crate::host::get_sw_root().map_err(|_| LoadError::SwRootNotSet)?;

    Ok(root.join("params").join(param_file_path))
}

/// Load a parameter file from an explicit path, usually one given by [`path`].
pub fn load_path<P, F>(path: F) -> Result<P, LoadError>
where
    P: DeserializeOwned,
    F: AsRef<Path>,
{
    let path = path.as_ref();
    let params_str =
        read_to_string(path).map_err(|e| LoadError::FileLoadError(path.to_path_buf(), e))?;

    from_str(&params_str)
}

/// Parse parameters from a TOML string.
pub fn from_str<P>(params_str: &str) -> Result<P, LoadError>
where
    P: DeserializeOwned,
{
    toml::from_str(params_str).map_err(LoadError::DeserialiseError)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Limits {
        speed_deg_s: f64,
        node_ids: [u8; 3],
    }

    #[test]
    fn test_load_path() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("limits.toml");
        std::fs::write(&file, "speed_deg_s = 12.5\nnode_ids = [1, 2, 3]\n").unwrap();

        let limits: Limits = load_path(&file).unwrap();
        assert_eq!(
            limits,
            Limits {
                speed_deg_s: 12.5,
                node_ids: [1, 2, 3]
            }
        );

        assert!(matches!(
            load_path::<Limits, _>(tmp.path().join("missing.toml")),
            Err(LoadError::FileLoadError(_, _))
        ));
        assert!(matches!(
            from_str::<Limits>("speed_deg_s = \"fast\""),
            Err(LoadError::DeserialiseError(_))
        ));
    }
}
