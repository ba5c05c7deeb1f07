#[cfg(not(target_arch = "wasm32"))]
use jemallocator::Jemalloc;

#[cfg(not(target_arch = "wasm32"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    let exit_code = match kiln::run::run() {
        Ok(code) => code,
        Err(err) => {
            println!("kiln: error: {:#}", err);
            1
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
