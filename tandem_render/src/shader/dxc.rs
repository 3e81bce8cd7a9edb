//! Invocation of the external DXC compiler.

use std::path::Path;
use std::process::Command;

use crate::backend::ShaderStage;

/// Environment variable overriding the path of the `dxc` executable.
pub const DXC_ENV: &str = "TANDEM_DXC";

const DXC: &str = "dxc";

/// Shader model 6.0 profile of a stage.
pub const fn profile(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vs_6_0",
        ShaderStage::Fragment => "ps_6_0",
    }
}

/// Command line arguments for compiling `entry` of `input` into `output`.
pub fn arguments(
    input: &Path,
    output: &Path,
    entry: &str,
    stage: ShaderStage,
    debug: bool,
) -> Vec<String> {
    let mut args = vec![
        "-E".to_owned(),
        entry.to_owned(),
        "-T".to_owned(),
        profile(stage).to_owned(),
    ];

    if debug {
        args.extend(["-Od", "-Zi", "-Qembed_debug"].map(str::to_owned));
    } else {
        args.push("-O3".to_owned());
    }

    args.push("-Fo".to_owned());
    args.push(output.to_string_lossy().into_owned());
    args.push(input.to_string_lossy().into_owned());
    args
}

/// Compiles HLSL `source` to DXIL.
///
/// Returns the compiler output as the error on failure.
pub fn compile(source: &str, entry: &str, stage: ShaderStage, debug: bool) -> Result<Vec<u8>, String> {
    // Removed with all files in it when dropped.
    let dir = tempfile::Builder::new()
        .prefix("tandem-dxc")
        .tempdir()
        .map_err(|err| format!("failed to create temporary directory: {}", err))?;
    let input = dir.path().join("shader.hlsl");
    let output = dir.path().join("shader.dxil");

    std::fs::write(&input, source)
        .map_err(|err| format!("failed to write {}: {}", input.display(), err))?;

    let dxc = std::env::var(DXC_ENV).unwrap_or_else(|_| DXC.to_owned());
    let args = arguments(&input, &output, entry, stage, debug);
    tracing::debug!("{} {}", dxc, args.join(" "));

    let result = Command::new(&dxc)
        .args(&args)
        .output()
        .map_err(|err| format!("failed to run {}: {}", dxc, err))?;

    if !result.status.success() {
        let mut log = String::from_utf8_lossy(&result.stderr).into_owned();
        log.push_str(&String::from_utf8_lossy(&result.stdout));
        return Err(format!("{} exited with {}: {}", dxc, result.status, log));
    }

    std::fs::read(&output).map_err(|err| format!("failed to read {}: {}", output.display(), err))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::backend::ShaderStage;

    use super::{arguments, profile};

    #[test]
    fn dxc_arguments() {
        let args = arguments(
            Path::new("in.hlsl"),
            Path::new("out.dxil"),
            "vs_main",
            ShaderStage::Vertex,
            false,
        );
        assert_eq!(
            args,
            ["-E", "vs_main", "-T", "vs_6_0", "-O3", "-Fo", "out.dxil", "in.hlsl"]
        );

        let args = arguments(
            Path::new("in.hlsl"),
            Path::new("out.dxil"),
            "fs_main",
            ShaderStage::Fragment,
            true,
        );
        assert_eq!(&args[..4], ["-E", "fs_main", "-T", "ps_6_0"]);
        assert!(args.contains(&"-Zi".to_owned()));
        assert_eq!(profile(ShaderStage::Fragment), "ps_6_0");
    }
}
