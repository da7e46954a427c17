use std::fmt;

/// Architecture class used to pick the artifact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm64,
}

impl Architecture {
    /// Key used in the release feed's `arch_urls` map and in package names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify from the process architecture and whether the OS is 64-bit.
/// arm64 wins outright; otherwise a 64-bit OS means x64, else x86.
pub fn classify(process_arch: &str, os_is_64bit: bool) -> Architecture {
    if process_arch == "aarch64" {
        Architecture::Arm64
    } else if os_is_64bit {
        Architecture::X64
    } else {
        Architecture::X86
    }
}

/// Architecture of the running process/OS.
pub fn detect() -> Architecture {
    classify(std::env::consts::ARCH, os_is_64bit())
}

fn os_is_64bit() -> bool {
    if cfg!(target_pointer_width = "64") {
        return true;
    }
    // 32-bit process on 64-bit Windows exposes the real architecture here.
    std::env::var("PROCESSOR_ARCHITEW6432")
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}
