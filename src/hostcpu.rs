//! Host CPU capability map.
//!
//! Answers one question: can this machine execute an instruction that
//! requires a given set of `CpuidFeature`s? Detection runs once per process
//! and is cached in a `OnceLock`. Most bits come from
//! `is_x86_feature_detected!`; the few it does not expose (RDTSCP, OSXSAVE)
//! are read from raw CPUID leaves. Features the map does not know are
//! reported unsupported, which makes the classifier skip the instruction
//! rather than risk executing it.

use std::sync::OnceLock;

use iced_x86::CpuidFeature;

#[derive(Debug, Default)]
pub struct HostCpu {
    mmx: bool,
    sse: bool,
    sse2: bool,
    sse3: bool,
    ssse3: bool,
    sse4_1: bool,
    sse4_2: bool,
    sse4a: bool,
    popcnt: bool,
    lzcnt: bool,
    bmi1: bool,
    bmi2: bool,
    tbm: bool,
    adx: bool,
    movbe: bool,
    aes: bool,
    pclmulqdq: bool,
    sha: bool,
    fma: bool,
    f16c: bool,
    gfni: bool,
    vaes: bool,
    vpclmulqdq: bool,
    rdrand: bool,
    rdseed: bool,
    rdtscp: bool,
    xsave: bool,
    osxsave: bool,
    avx: bool,
    avx2: bool,
    avx512f: bool,
    avx512bw: bool,
    avx512cd: bool,
    avx512dq: bool,
    avx512vl: bool,
    avx512ifma: bool,
    avx512vbmi: bool,
    avx512vbmi2: bool,
    avx512vnni: bool,
    avx512bitalg: bool,
    avx512vpopcntdq: bool,
    avx512bf16: bool,
}

static HOST: OnceLock<HostCpu> = OnceLock::new();

impl HostCpu {
    pub fn get() -> &'static HostCpu {
        HOST.get_or_init(HostCpu::detect)
    }

    #[cfg(target_arch = "x86_64")]
    fn detect() -> HostCpu {
        let cpuid_1_ecx = unsafe { core::arch::x86_64::__cpuid(1) }.ecx;
        let ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) }.edx;

        HostCpu {
            mmx: std::is_x86_feature_detected!("mmx"),
            sse: std::is_x86_feature_detected!("sse"),
            sse2: std::is_x86_feature_detected!("sse2"),
            sse3: std::is_x86_feature_detected!("sse3"),
            ssse3: std::is_x86_feature_detected!("ssse3"),
            sse4_1: std::is_x86_feature_detected!("sse4.1"),
            sse4_2: std::is_x86_feature_detected!("sse4.2"),
            sse4a: std::is_x86_feature_detected!("sse4a"),
            popcnt: std::is_x86_feature_detected!("popcnt"),
            lzcnt: std::is_x86_feature_detected!("lzcnt"),
            bmi1: std::is_x86_feature_detected!("bmi1"),
            bmi2: std::is_x86_feature_detected!("bmi2"),
            tbm: std::is_x86_feature_detected!("tbm"),
            adx: std::is_x86_feature_detected!("adx"),
            movbe: std::is_x86_feature_detected!("movbe"),
            aes: std::is_x86_feature_detected!("aes"),
            pclmulqdq: std::is_x86_feature_detected!("pclmulqdq"),
            sha: std::is_x86_feature_detected!("sha"),
            fma: std::is_x86_feature_detected!("fma"),
            f16c: std::is_x86_feature_detected!("f16c"),
            gfni: std::is_x86_feature_detected!("gfni"),
            vaes: std::is_x86_feature_detected!("vaes"),
            vpclmulqdq: std::is_x86_feature_detected!("vpclmulqdq"),
            rdrand: std::is_x86_feature_detected!("rdrand"),
            rdseed: std::is_x86_feature_detected!("rdseed"),
            rdtscp: ext & (1 << 27) != 0,
            xsave: std::is_x86_feature_detected!("xsave"),
            osxsave: cpuid_1_ecx & (1 << 27) != 0,
            avx: std::is_x86_feature_detected!("avx"),
            avx2: std::is_x86_feature_detected!("avx2"),
            avx512f: std::is_x86_feature_detected!("avx512f"),
            avx512bw: std::is_x86_feature_detected!("avx512bw"),
            avx512cd: std::is_x86_feature_detected!("avx512cd"),
            avx512dq: std::is_x86_feature_detected!("avx512dq"),
            avx512vl: std::is_x86_feature_detected!("avx512vl"),
            avx512ifma: std::is_x86_feature_detected!("avx512ifma"),
            avx512vbmi: std::is_x86_feature_detected!("avx512vbmi"),
            avx512vbmi2: std::is_x86_feature_detected!("avx512vbmi2"),
            avx512vnni: std::is_x86_feature_detected!("avx512vnni"),
            avx512bitalg: std::is_x86_feature_detected!("avx512bitalg"),
            avx512vpopcntdq: std::is_x86_feature_detected!("avx512vpopcntdq"),
            avx512bf16: std::is_x86_feature_detected!("avx512bf16"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn detect() -> HostCpu {
        HostCpu::default()
    }

    pub fn has(&self, f: CpuidFeature) -> bool {
        use CpuidFeature as F;
        match f {
            // Baseline for any 64-bit capable part.
            F::INTEL8086 | F::INTEL186 | F::INTEL286 | F::INTEL386 | F::INTEL486 => true,
            F::CPUID | F::TSC | F::CMOV | F::MULTIBYTENOP => true,
            F::X64 => cfg!(target_arch = "x86_64"),

            F::MMX => self.mmx,
            F::SSE => self.sse,
            F::SSE2 => self.sse2,
            F::SSE3 => self.sse3,
            F::SSSE3 => self.ssse3,
            F::SSE4_1 => self.sse4_1,
            F::SSE4_2 => self.sse4_2,
            F::SSE4A => self.sse4a,
            F::POPCNT => self.popcnt,
            F::LZCNT => self.lzcnt,
            F::BMI1 => self.bmi1,
            F::BMI2 => self.bmi2,
            F::TBM => self.tbm,
            F::ADX => self.adx,
            F::MOVBE => self.movbe,
            F::AES => self.aes,
            F::PCLMULQDQ => self.pclmulqdq,
            F::SHA => self.sha,
            F::FMA => self.fma,
            F::F16C => self.f16c,
            F::GFNI => self.gfni,
            F::VAES => self.vaes,
            F::VPCLMULQDQ => self.vpclmulqdq,
            F::RDRAND => self.rdrand,
            F::RDSEED => self.rdseed,
            F::RDTSCP => self.rdtscp,
            F::XSAVE => self.xsave && self.osxsave,
            F::AVX => self.avx,
            F::AVX2 => self.avx2,
            F::AVX512F => self.avx512f,
            F::AVX512BW => self.avx512bw,
            F::AVX512CD => self.avx512cd,
            F::AVX512DQ => self.avx512dq,
            F::AVX512VL => self.avx512vl,
            F::AVX512_IFMA => self.avx512ifma,
            F::AVX512_VBMI => self.avx512vbmi,
            F::AVX512_VBMI2 => self.avx512vbmi2,
            F::AVX512_VNNI => self.avx512vnni,
            F::AVX512_BITALG => self.avx512bitalg,
            F::AVX512_VPOPCNTDQ => self.avx512vpopcntdq,
            F::AVX512_BF16 => self.avx512bf16,

            // Anything the map does not know about is treated as absent.
            _ => false,
        }
    }

    pub fn supports_all(&self, required: &[CpuidFeature]) -> bool {
        required.iter().all(|&f| self.has(f))
    }

    /// `vzeroupper` cleanup is only emitted when the host can execute it.
    pub fn has_avx(&self) -> bool {
        self.avx
    }
}
