fn main() {
    println!("Tic Tac Toe - 2 Player Network Game");
    println!();
    println!("Usage:");
    println!("  Start the server:   cargo run --bin server");
    println!("  Connect a client:   cargo run --bin client [host:port]");
    println!();
    println!("The server listens on port 7878.");
    println!("Run two clients to start a game. Default host is 127.0.0.1:7878.");
}
