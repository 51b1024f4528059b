// Copyright 2021 Joyent, Inc.

use std::process;
use std::time::Instant;

use clap::{crate_version, App, Arg};

use patch_ipc::Node;

static DEFAULT_SOCKET: &str = "/tmp/patch.sock";

#[tokio::main]
async fn main() {
    let matches = App::new("consumer")
        .about("Command-line tool for calling the KV producer demo")
        .version(crate_version!())
        .arg(
            Arg::with_name("socket")
                .help("Socket path (Default: /tmp/patch.sock)")
                .long("socket")
                .short("s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("keys")
                .help("Number of keys to write (Default: 10)")
                .long("keys")
                .short("k")
                .takes_value(true),
        )
        .get_matches();
    let socket = matches.value_of("socket").unwrap_or(DEFAULT_SOCKET);
    let keys: usize = matches
        .value_of("keys")
        .unwrap_or("10")
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("bad key count: {}", e);
            process::exit(1)
        });

    let node = Node::new();
    if let Err(e) = node.dial(socket).await {
        eprintln!("error dialing broker: {}", e);
        process::exit(1);
    }

    println!("Setting {} keys.", keys);
    let start = Instant::now();
    let mut unit = ();
    for i in 0..keys {
        let kv = (format!("key-{}", i), format!("value-{}", i));
        if let Err(e) = node.call("KV.Set", &kv, &mut unit).await {
            eprintln!("call failed: {}", e);
            process::exit(1);
        }
    }
    println!("Total request time: {:?}.", start.elapsed());

    println!("\nGetting key count...");
    let start = Instant::now();
    let mut count = 0usize;
    match node.call("KVCount", &(), &mut count).await {
        Ok(()) => println!(
            "Request took {:?}; total keys in keystore: {}",
            start.elapsed(),
            count
        ),
        Err(e) => eprintln!("{}", e),
    }

    for i in 0..keys {
        let mut value = String::new();
        match node.call("KV.Get", &format!("key-{}", i), &mut value).await {
            Ok(()) => println!("key-{}: {}", i, value),
            Err(e) => {
                eprintln!("call failed: {}", e);
                process::exit(1);
            }
        }
    }
}
