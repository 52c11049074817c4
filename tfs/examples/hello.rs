use tfs::{OpenMode, TFS};

pub fn main() {
    // create a new file system, write a greeting to /hello and read it back
    let fs = TFS::create().expect("should create");
    let fh = fs.open("/hello", OpenMode::CREATE).unwrap();
    fs.write(fh, b"hello, world\n").unwrap();
    fs.close(fh).unwrap();

    let fh = fs.open("/hello", OpenMode::empty()).unwrap();
    let greeting = fs.read(fh, 64).unwrap();
    fs.close(fh).unwrap();
    print!("{}", String::from_utf8_lossy(&greeting));

    fs.destroy();
}
