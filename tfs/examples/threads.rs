use std::env;
use std::sync::Arc;
use std::thread;

use tfs::{OpenMode, TFS};

/// Creates one file per thread, then copies each of them out to the host directory
/// given as the first argument (the current directory by default).
pub fn main() {
    let out_dir = env::args().nth(1).unwrap_or_else(|| ".".to_string());
    let fs = Arc::new(TFS::create().expect("should create"));

    let workers: Vec<_> = (0..3)
        .map(|n| {
            let fs = Arc::clone(&fs);
            let out_dir = out_dir.clone();
            thread::spawn(move || {
                let path = format!("/f{}", n);
                let fh = fs.open(&path, OpenMode::CREATE).unwrap();
                fs.write(fh, format!("thread {}\n", n).as_bytes()).unwrap();
                fs.close(fh).unwrap();
                fs.copy_to_external(&path, format!("{}/f{}", out_dir, n))
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    println!("{:?}", fs.list().unwrap());
}
