//! Scripted walkthrough of the socket namespace over an in-memory loopback
//! engine: a TCP listener and client exchange greetings, then two UDP
//! sockets trade datagrams, with the namespace tree printed along the way.

use clap::Parser;
use netfs::{EndpointKind, Handle, Limits, Netfs, Progress, Proto, Result};

mod loopback;
use crate::loopback::LoopEngine;

#[derive(Parser)]
#[command(about = "Walk a loopback network through the socket namespace")]
struct Args {
    /// Seed for socket identifier allocation.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Messages to exchange over the demo stream.
    #[arg(long, default_value_t = 3)]
    count: usize,
}

type Fs = Netfs<LoopEngine>;

/// Loopback work completes inside the call that caused it, so a pending
/// result here means the script itself is wrong.
fn done<T>(p: Progress<T>) -> T {
    p.ready().expect("loopback operations complete synchronously")
}

fn read_line(fs: &mut Fs, h: Handle) -> Result<String> {
    let bytes = done(fs.read(h, 256)?);
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// `open_new` + read back the allocated identifier.
fn new_socket(fs: &mut Fs, proto: Proto) -> Result<netfs::SockId> {
    let h = fs.open_new(proto)?;
    let line = read_line(fs, h)?;
    fs.close(h)?;
    let id = line
        .trim_end()
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .map(netfs::SockId)
        .expect("allocation endpoint returns <proto>/<id>");
    println!("  allocated {}", line.trim_end());
    Ok(id)
}

fn write_all(fs: &mut Fs, h: Handle, payload: &str) -> Result<()> {
    done(fs.write(h, payload.as_bytes())?);
    Ok(())
}

fn print_tree(fs: &Fs) {
    println!("  namespace:");
    for proto in [Proto::Tcp, Proto::Udp] {
        println!("    /{proto}");
        println!("      new_socket");
        for id in fs.list(proto) {
            println!("      {id}/");
            if let Ok(kinds) = fs.endpoints(proto, id) {
                let names: Vec<_> = kinds.iter().copied().map(EndpointKind::name).collect();
                println!("        {}", names.join(" "));
            }
        }
    }
}

fn stream_demo(fs: &mut Fs, count: usize) -> Result<()> {
    println!("stream demo");

    let server = new_socket(fs, Proto::Tcp)?;
    let b = fs.open(Proto::Tcp, server, EndpointKind::Bind)?;
    write_all(fs, b, "0.0.0.0:7777")?;
    fs.close(b)?;
    let l = fs.open(Proto::Tcp, server, EndpointKind::Listen)?;
    write_all(fs, l, "8")?;
    fs.close(l)?;

    let client = new_socket(fs, Proto::Tcp)?;
    let b = fs.open(Proto::Tcp, client, EndpointKind::Bind)?;
    write_all(fs, b, "127.0.0.1:41000")?;
    fs.close(b)?;

    print_tree(fs);

    // The loopback engine establishes both ends during this write.
    let c = fs.open(Proto::Tcp, client, EndpointKind::Connect)?;
    write_all(fs, c, "127.0.0.1:7777")?;
    fs.close(c)?;

    let a = fs.open(Proto::Tcp, server, EndpointKind::Accept)?;
    let accepted_line = read_line(fs, a)?;
    fs.close(a)?;
    let accepted = accepted_line
        .trim_end()
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .map(netfs::SockId)
        .expect("accept returns <proto>/<id>");
    println!("  accepted {}", accepted_line.trim_end());

    let cd = fs.open(Proto::Tcp, client, EndpointKind::Data)?;
    let sd = fs.open(Proto::Tcp, accepted, EndpointKind::Data)?;
    for n in 0..count {
        let msg = format!("hello {n}");
        done(fs.write(cd, msg.as_bytes())?);
        let got = done(fs.read(sd, 256)?);
        println!("  server read {:?}", String::from_utf8_lossy(&got));

        let reply = format!("ack {n}");
        done(fs.write(sd, reply.as_bytes())?);
        let got = done(fs.read(cd, 256)?);
        println!("  client read {:?}", String::from_utf8_lossy(&got));
    }

    let r = fs.open(Proto::Tcp, accepted, EndpointKind::Remote)?;
    println!("  server sees remote {}", read_line(fs, r)?.trim_end());
    fs.close(r)?;

    fs.close(cd)?;
    fs.close(sd)?;
    for id in [server, client, accepted] {
        fs.remove(Proto::Tcp, id)?;
    }
    Ok(())
}

fn datagram_demo(fs: &mut Fs) -> Result<()> {
    println!("datagram demo");

    let rx = new_socket(fs, Proto::Udp)?;
    let b = fs.open(Proto::Udp, rx, EndpointKind::Bind)?;
    write_all(fs, b, "0.0.0.0:5353")?;
    fs.close(b)?;

    let tx = new_socket(fs, Proto::Udp)?;
    let t = fs.open(Proto::Udp, tx, EndpointKind::To)?;
    write_all(fs, t, "127.0.0.1:5353")?;
    fs.close(t)?;

    let td = fs.open(Proto::Udp, tx, EndpointKind::Data)?;
    write_all(fs, td, "query")?;
    fs.close(td)?;

    let f = fs.open(Proto::Udp, rx, EndpointKind::From)?;
    println!("  datagram from {}", read_line(fs, f)?.trim_end());
    fs.close(f)?;
    let rd = fs.open(Proto::Udp, rx, EndpointKind::Data)?;
    let got = done(fs.read(rd, 256)?);
    println!("  payload {:?}", String::from_utf8_lossy(&got));
    fs.close(rd)?;

    for id in [rx, tx] {
        fs.remove(Proto::Udp, id)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut fs = Netfs::with_seed(LoopEngine::new(), Limits::default(), args.seed);
    stream_demo(&mut fs, args.count)?;
    datagram_demo(&mut fs)?;

    println!("done");
    Ok(())
}
