use clap::Parser as ClapParser;
use std::{fs, path::PathBuf, process};

use object::special_index;
use vm::image::{self, LoadedImage};
use vm::{Exit, VM, VmConfig};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Squeak V3 image runner", long_about = None)]
struct Cli {
    /// Snapshot to load
    image: PathBuf,

    /// Sends and backward jumps between interrupt checks
    #[arg(long, default_value_t = VmConfig::default().check_interval)]
    check_interval: u32,

    /// Allocations between automatic collections
    #[arg(long, default_value_t = VmConfig::default().gc_threshold)]
    gc_threshold: usize,

    /// Stop after this many bytecodes (0 runs until the image quits)
    #[arg(long, default_value_t = 0)]
    max_bytecodes: u64,

    /// Log filter, e.g. `debug` or `vm=trace` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Where the snapshot primitive writes; defaults to the loaded image
    #[arg(long)]
    snapshot_path: Option<PathBuf>,

    /// Print the header and special objects, then exit
    #[arg(long)]
    info: bool,

    /// Read the image and write it back to this path without running it
    #[arg(long, value_name = "PATH")]
    resave: Option<PathBuf>,
}

fn init_logging(filter: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

fn read(path: &PathBuf) -> LoadedImage {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("Error reading image '{}': {}", path.display(), err);
            process::exit(1);
        }
    };
    match image::read_image(&bytes) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("Error loading '{}': {}", path.display(), err);
            process::exit(1);
        }
    }
}

fn resave(source: &PathBuf, target: &PathBuf) {
    let loaded = read(source);
    let written = image::write_image(&loaded.memory, loaded.specials, &loaded.header)
        .map_err(|err| err.to_string())
        .and_then(|bytes| fs::write(target, bytes).map_err(|err| err.to_string()));
    if let Err(err) = written {
        eprintln!("Error writing '{}': {}", target.display(), err);
        process::exit(1);
    }
    println!("{} objects written to {}", loaded.memory.live_count(), target.display());
}

fn print_info(vm: &VM) {
    let header = &vm.header;
    let (width, height) = header.window_size();
    println!("version          {}", header.version);
    println!("byte order       {}", if header.big_endian { "big endian" } else { "little endian" });
    println!("objects          {}", vm.memory.live_count());
    println!("body size        {} bytes", header.end_of_memory);
    println!("window           {width}x{height}{}", if header.full_screen { " (full screen)" } else { "" });
    println!("closures         {}", vm.special.class_block_closure.is_some());
    let named = [
        ("SmallInteger", vm.special.class_small_integer),
        ("Array", vm.special.class_array),
        ("MethodContext", vm.special.class_method_context),
        ("Process", vm.special.class_process),
    ];
    for (label, class) in named {
        println!("{label:<16} {}", vm.class_name(class));
    }
    let display = vm.special.get(&vm.memory, special_index::DISPLAY);
    println!("display          {}", if display == vm.nil() { "none" } else { "installed" });
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    if let Some(target) = &cli.resave {
        resave(&cli.image, target);
        return;
    }

    let config = VmConfig {
        check_interval: cli.check_interval,
        gc_threshold: cli.gc_threshold,
        max_bytecodes: cli.max_bytecodes,
        snapshot_path: Some(cli.snapshot_path.clone().unwrap_or_else(|| cli.image.clone())),
        ..VmConfig::default()
    };

    if cli.info {
        let loaded = read(&cli.image);
        match VM::from_image(loaded.memory, loaded.specials, loaded.header, config) {
            Ok(vm) => print_info(&vm),
            Err(err) => {
                eprintln!("Error: {}", err);
                process::exit(1);
            }
        }
        return;
    }

    let mut vm = match VM::load(&cli.image, config) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error loading '{}': {}", cli.image.display(), err);
            process::exit(1);
        }
    };
    match vm.run() {
        Ok(Exit::Quit) => {}
        Ok(exit) => {
            let stats = vm.stats();
            log::info!(
                "stopped ({exit:?}) after {} bytecodes, {} sends",
                stats.bytecodes,
                stats.sends
            );
        }
        Err(halt) => {
            eprintln!("VM halted: {}", halt);
            process::exit(2);
        }
    }
}
