use std::env;

const PATH_TO_LINKER_SCRIPT: &str = "linker.ld";

fn main() -> Result<(), String> {
    // "The build script's current directory is the source directory of the build script's
    // package."
    let path = env::current_dir()
        .map_err(|err| format!("Unable to access project directory: {err}"))?
        .into_os_string()
        .into_string()
        .map_err(|err| {
            format!(
                "Project directory path is not valid unicode (approximately {})",
                err.to_string_lossy()
            )
        })?;

    println!("cargo:rerun-if-changed={PATH_TO_LINKER_SCRIPT}");

    println!(
        "cargo:rustc-link-arg-bin=icevmm=--script={}/{}",
        path, PATH_TO_LINKER_SCRIPT
    );
    // Disable section alignment padding; the image is loaded as a flat blob by QEMU's `-kernel`.
    println!("cargo:rustc-link-arg-bin=icevmm=-n");

    // Produce a raw, stripped binary instead of an ELF outside of debug builds. In debug builds
    // we keep the ELF so GDB has symbols to work with.
    match env::var("DEBUG")
        .expect("Cargo should specify the `DEBUG` environment variable")
        .as_str()
    {
        "false" => {
            println!("cargo:rustc-link-arg-bin=icevmm=--oformat=binary");
            println!("cargo:rustc-link-arg-bin=icevmm=--strip-all");
        }
        "true" => {}
        _ => unreachable!("cargo only ever sets DEBUG to \"true\" or \"false\""),
    }

    Ok(())
}
