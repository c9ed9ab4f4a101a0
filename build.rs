use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Bytes reserved at the start of each page for the slab header and bitmap.
/// Must stay in sync with the `static_assertions` check in `src/slab.rs`.
const SLOT_BASE_OFFSET: usize = 256;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    epoch_count: Option<usize>,
    cache_capacity: Option<usize>,
    max_domain_depth: Option<usize>,
    scan_enable_permille: Option<u64>,
    scan_disable_permille: Option<u64>,
    scan_heartbeat_shift: Option<u32>,
    scan_dwell_heartbeats: Option<u32>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default)]
    classes: Vec<usize>,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    epoch_count: usize,
    cache_capacity: usize,
    max_domain_depth: usize,
    scan_enable_permille: u64,
    scan_disable_permille: u64,
    scan_heartbeat_shift: u32,
    scan_dwell_heartbeats: u32,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(8192);
    assert!(
        page_size > 0 && page_size.is_power_of_two(),
        "page_size ({}) must be a power of 2",
        page_size
    );
    assert!(
        page_size >= 4096,
        "page_size ({}) must be >= 4096",
        page_size
    );

    let epoch_count = cfg.epoch_count.unwrap_or(16);
    assert!(
        epoch_count.is_power_of_two() && (2..=16).contains(&epoch_count),
        "epoch_count ({}) must be a power of 2 in 2..=16",
        epoch_count
    );

    let cache_capacity = cfg.cache_capacity.unwrap_or(32);
    assert!(cache_capacity > 0, "cache_capacity must be > 0");

    let max_domain_depth = cfg.max_domain_depth.unwrap_or(32);
    assert!(max_domain_depth > 0, "max_domain_depth must be > 0");

    let scan_enable_permille = cfg.scan_enable_permille.unwrap_or(300);
    let scan_disable_permille = cfg.scan_disable_permille.unwrap_or(100);
    assert!(
        scan_disable_permille < scan_enable_permille,
        "scan_disable_permille ({}) must be < scan_enable_permille ({})",
        scan_disable_permille,
        scan_enable_permille
    );
    assert!(
        scan_enable_permille <= 1000,
        "scan_enable_permille ({}) must be <= 1000",
        scan_enable_permille
    );

    let scan_heartbeat_shift = cfg.scan_heartbeat_shift.unwrap_or(18);
    assert!(
        (8..=30).contains(&scan_heartbeat_shift),
        "scan_heartbeat_shift ({}) must be in 8..=30",
        scan_heartbeat_shift
    );

    let scan_dwell_heartbeats = cfg.scan_dwell_heartbeats.unwrap_or(50);
    assert!(scan_dwell_heartbeats > 0, "scan_dwell_heartbeats must be > 0");

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        epoch_count,
        cache_capacity,
        max_domain_depth,
        scan_enable_permille,
        scan_disable_permille,
        scan_heartbeat_shift,
        scan_dwell_heartbeats,
    }
}

fn slot_count(size: usize, page_size: usize) -> usize {
    ((page_size - SLOT_BASE_OFFSET) / size).min(255)
}

fn validate_classes(classes: &[usize], page_size: usize) {
    assert!(!classes.is_empty(), "config must define at least one class");
    assert!(
        classes.len() < 255,
        "too many size classes ({}, max 254)",
        classes.len()
    );
    for (i, &size) in classes.iter().enumerate() {
        assert!(
            size % 8 == 0,
            "class {}: size {} must be 8-byte aligned",
            i,
            size
        );
        assert!(size >= 64, "class {}: size {} must be >= 64", i, size);
        assert!(
            size <= page_size / 8,
            "class {}: size {} must be <= page_size/8 ({})",
            i,
            size,
            page_size / 8
        );
        assert!(
            slot_count(size, page_size) >= 2,
            "class {}: size {} yields fewer than 2 slots per page",
            i,
            size
        );
        if i > 0 {
            assert!(
                size > classes[i - 1],
                "class {}: size {} must be > previous size {}",
                i,
                size,
                classes[i - 1]
            );
        }
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/epochalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, classes: &[usize], out_path: &Path) {
    let max_slots = classes
        .iter()
        .map(|&s| slot_count(s, cfg.page_size))
        .max()
        .unwrap();
    let bitmap_words = max_slots.div_ceil(32);

    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const EPOCH_COUNT: usize = {};\n\
         pub const CACHE_CAPACITY: usize = {};\n\
         pub const MAX_DOMAIN_DEPTH: usize = {};\n\
         pub const SLOT_BASE_OFFSET: usize = {};\n\
         pub const BITMAP_WORDS: usize = {};\n\
         pub const SCAN_ENABLE_PERMILLE: u64 = {};\n\
         pub const SCAN_DISABLE_PERMILLE: u64 = {};\n\
         pub const SCAN_HEARTBEAT_MASK: u64 = {};\n\
         pub const SCAN_DWELL_HEARTBEATS: u32 = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.epoch_count,
        cfg.cache_capacity,
        cfg.max_domain_depth,
        SLOT_BASE_OFFSET,
        bitmap_words,
        cfg.scan_enable_permille,
        cfg.scan_disable_permille,
        (1u64 << cfg.scan_heartbeat_shift) - 1,
        cfg.scan_dwell_heartbeats,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(classes: &[usize], page_size: usize, out_path: &Path) {
    let num_size_classes = classes.len() + 1;

    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub const NUM_SIZE_CLASSES: usize = {};\n\
         pub const MAX_OBJECT_SIZE: usize = {};\n\n",
        num_size_classes,
        classes[classes.len() - 1],
    ));
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {num_size_classes}] = [\n\
         \x20   SizeClassInfo {{ size: 0, slot_count: 0 }}, // sentinel\n",
    ));
    for &size in classes {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, slot_count: {} }},\n",
            size,
            slot_count(size, page_size)
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=EPOCHALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("EPOCHALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    validate_classes(&config.classes, resolved.page_size);

    generate_config(
        &resolved,
        &config.classes,
        &Path::new(&out_dir).join("config_gen.rs"),
    );
    generate_size_classes(
        &config.classes,
        resolved.page_size,
        &Path::new(&out_dir).join("size_class_gen.rs"),
    );
}
