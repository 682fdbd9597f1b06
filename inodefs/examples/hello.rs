use std::env;

use inodefs::FsError;

/// Formats the image named on the command line (default `hello.img`), creates
/// a few directories, and lists the root.
pub fn main() -> Result<(), FsError> {
    let image = env::args().nth(1).unwrap_or_else(|| "hello.img".to_string());

    let fs = inodefs::mkfs(&image)?;
    for path in &["/bin", "/home", "/home/hello"] {
        let inode_num = fs.directory_make(path)?;
        println!("made {} as inode {}", path, inode_num);
    }

    let hello = fs.namei("/home/hello")?;
    println!("/home/hello resolves to inode {}", hello.inode_num());
    hello.put()?;

    fs.ls(&mut std::io::stdout())
}
