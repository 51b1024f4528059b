// Copyright 2021 Joyent, Inc.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use clap::{crate_version, App, Arg};
use slog::{error, info, o, Drain, Logger};

use patch_ipc::{json_handler, Error, Handler, MethodSet, Node};

static DEFAULT_SOCKET: &str = "/tmp/patch.sock";

#[derive(Clone, Default)]
struct KvStore {
    data: Arc<Mutex<HashMap<String, String>>>,
}

impl MethodSet for KvStore {
    fn methods(&self) -> Vec<(String, Handler)> {
        let set = {
            let data = self.data.clone();
            json_handler(move |kv: (String, String), _out: &mut ()| {
                data.lock().unwrap().insert(kv.0, kv.1);
                Ok(())
            })
        };
        let get = {
            let data = self.data.clone();
            json_handler(move |key: String, out: &mut String| {
                match data.lock().unwrap().get(&key) {
                    Some(v) => {
                        *out = v.clone();
                        Ok(())
                    }
                    None => Err(String::from("Key not found.")),
                }
            })
        };
        vec![(String::from("Set"), set), (String::from("Get"), get)]
    }
}

#[tokio::main]
async fn main() {
    let matches = App::new("producer")
        .about("Serves a KV method set on the Patch fabric")
        .version(crate_version!())
        .arg(
            Arg::with_name("socket")
                .help("Socket path (Default: /tmp/patch.sock)")
                .long("socket")
                .short("s")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("debug")
                .help("Trace every frame")
                .long("debug")
                .short("d"),
        )
        .get_matches();
    let socket = matches.value_of("socket").unwrap_or(DEFAULT_SOCKET);

    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => crate_version!()),
    );

    let node = Node::new();
    node.set_log_sink(std::io::stdout());
    node.set_debug(matches.is_present("debug"));

    let store = KvStore::default();
    node.register_object("KV", &store);

    let count_data = store.data.clone();
    node.register_fn("KVCount", move |_: (), count: &mut usize| {
        *count = count_data.lock().unwrap().len();
        Ok(())
    });

    node.register_fn("Ping", |_: (), _: &mut ()| Ok(()));

    info!(log, "serving patch requests";
          "socket" => socket, "addr" => node.addr());

    match node.listen(socket).await {
        Err(Error::Closed) => info!(log, "broker went away; exiting"),
        Err(e) => error!(log, "fabric error"; "err" => %e),
        Ok(()) => {}
    }
}
