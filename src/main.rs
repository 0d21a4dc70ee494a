use std::{
    env, fmt, fs,
    net::{IpAddr, Ipv4Addr},
    process,
    str::FromStr,
    time::Duration,
};

use ikev1::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm, PaddingConfig, WeakKeyPolicy};
use ikev1::policy::{
    AuthMethod, Encapsulation, EspCipher, ExchangeMode, IntegrityAlgorithm, IpsecTransform,
    Phase1Proposal, PskTable, RemoteConfig, Sainfo, Subnet, TrafficSelectors,
};

mod ikev1;
mod logger;

enum Action {
    Serve(ikev1::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: ikev1d [OPTIONS] <serve|connect>\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --listen-ip=<IP>                 Listen IP address, multiple options can be provided [default: 0.0.0.0]\
\n      --port=<PORT>                    IKE port [default: 500]\
\n      --peer=<IP>                      Peer address [default: accept any peer]\
\n      --exchange=<MODE>                Phase 1 mode: main, aggressive or base [default: main]\
\n      --auth=<METHOD>                  Authentication: psk or rsasig [default: psk]\
\n      --psk=<ID>:<KEY>                 Pre-shared key for an address or identity, multiple options can be provided\
\n      --id=<ID>                        Local identity (IP, FQDN or user@FQDN)\
\n      --peer-id=<ID>                   Expected peer identity\
\n      --verify-id=<BOOL>               Check the peer identity [default: false]\
\n      --cipher=<CIPHER>                Phase 1 cipher: aes128, aes192, aes256, 3des, des, blowfish or cast [default: aes128]\
\n      --hash=<HASH>                    Phase 1 hash: md5, sha1, sha256, sha384 or sha512 [default: sha1]\
\n      --dh-group=<GROUP>               Phase 1 DH group: 1, 2, 5 or 14 [default: 2]\
\n      --lifetime=<SECONDS>             Phase 1 lifetime [default: 28800]\
\n      --retry-count=<COUNT>            Resend attempts [default: 5]\
\n      --retry-interval=<SECONDS>       Resend interval [default: 10]\
\n      --passive=<BOOL>                 Never initiate negotiations [default: false]\
\n      --initial-contact=<BOOL>         Send INITIAL-CONTACT [default: true]\
\n      --cacert=<FILENAME>              Path to root CA certificate (in PEM format)\
\n      --cert=<FILENAME>                Path to public certificate (in PEM format)\
\n      --key=<FILENAME>                 Path to private key (in PKCS 8 PEM format)\
\n      --peer-cert=<FILENAME>           Path to the peer certificate, if the peer doesn't send one\
\n      --verify-cert=<BOOL>             Verify the peer certificate [default: true]\
\n      --pfs-group=<GROUP>              Phase 2 PFS group: 1, 2, 5 or 14 [default: none]\
\n      --local-net=<SUBNET>             Local traffic selector [default: local address]\
\n      --remote-net=<SUBNET>            Remote traffic selector [default: peer address]\
\n      --esp-cipher=<CIPHER>            ESP cipher: aes128, aes192, aes256, 3des, des, blowfish, cast or null [default: aes128]\
\n      --esp-auth=<AUTH>                ESP authentication: hmac-md5, hmac-sha1, hmac-sha256 or none [default: hmac-sha1]\
\n      --encapsulation=<MODE>           IPsec mode: tunnel or transport [default: tunnel]\
\n      --pad-strict=<BOOL>              Check padding strictly [default: false]\
\n      --weak-keys=<POLICY>             DES weak keys: reject or allow [default: allow]\
\n      --help                           Print help\
\n\nActions:\
\n      serve                            Respond to peers\
\n      connect                          Respond to peers and negotiate an SA with --peer at startup";

fn parse_bool(value: &str) -> Result<bool, &'static str> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => Err("Expected true or false"),
    }
}

fn parse_dh_group(value: &str) -> Result<DhGroup, &'static str> {
    value
        .parse::<u32>()
        .ok()
        .and_then(DhGroup::from_group_number)
        .ok_or("Unsupported DH group")
}

impl Args {
    fn parse() -> Args {
        let fail_with_error = |name: &str, value: &str, err: fmt::Arguments| {
            eprintln!(
                "Argument {} has an unsupported value {}: {}",
                name, value, err
            );
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };
        let read_file = |name: &str, value: &str| match fs::read_to_string(value) {
            Ok(contents) => contents,
            Err(err) => {
                fail_with_error(name, value, format_args!("Failed to read file: {}", err));
                process::exit(2);
            }
        };

        let mut log_level = log::LevelFilter::Info;
        let mut listen_ips = vec![];
        let mut port = 500;
        let mut peer = None;
        let mut exchange_mode = ExchangeMode::Main;
        let mut auth = AuthMethod::PreSharedKey;
        let mut psk = PskTable::new();
        let mut local_id = None;
        let mut peer_id = None;
        let mut verify_id = false;
        let mut encryption = EncryptionAlgorithm::Aes(16);
        let mut hash = HashAlgorithm::Sha1;
        let mut dh_group = DhGroup::Modp1024;
        let mut lifetime = Duration::from_secs(28800);
        let mut retry_count = None;
        let mut retry_interval = None;
        let mut passive = false;
        let mut initial_contact = true;
        let mut root_ca = None;
        let mut private_key = None;
        let mut public_cert = None;
        let mut peer_cert = None;
        let mut verify_cert = true;
        let mut pfs_group = None;
        let mut local_net = None;
        let mut remote_net = None;
        let mut esp_cipher = EspCipher::Aes(16);
        let mut esp_auth = Some(IntegrityAlgorithm::HmacSha1);
        let mut encapsulation = Encapsulation::Tunnel;
        let mut padding = PaddingConfig::default();
        let mut weak_keys = WeakKeyPolicy::Allow;

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };
            let check = |result: Result<(), &'static str>| {
                if let Err(err) = result {
                    fail_with_error(name, value, format_args!("{}", err));
                }
            };

            if name == "--log-level" {
                log_level = match value.to_uppercase().as_str() {
                    "TRACE" => log::LevelFilter::Trace,
                    "DEBUG" => log::LevelFilter::Debug,
                    "INFO" => log::LevelFilter::Info,
                    "WARN" => log::LevelFilter::Warn,
                    "ERROR" => log::LevelFilter::Error,
                    "OFF" => log::LevelFilter::Off,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported log level"));
                        process::exit(2);
                    }
                };
            } else if name == "--listen-ip" {
                match IpAddr::from_str(value) {
                    Ok(ip) => {
                        listen_ips.push(ip);
                    }
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--port" {
                match u16::from_str(value) {
                    Ok(value) => port = value,
                    Err(err) => {
                        fail_with_error(name, value, format_args!("Failed to parse port: {}", err))
                    }
                }
            } else if name == "--peer" {
                match IpAddr::from_str(value) {
                    Ok(ip) => peer = Some(ip),
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IP address: {}", err),
                    ),
                };
            } else if name == "--exchange" {
                exchange_mode = match value {
                    "main" => ExchangeMode::Main,
                    "aggressive" => ExchangeMode::Aggressive,
                    "base" => ExchangeMode::Base,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported exchange mode"));
                        process::exit(2);
                    }
                };
            } else if name == "--auth" {
                auth = match value {
                    "psk" => AuthMethod::PreSharedKey,
                    "rsasig" => AuthMethod::RsaSignature,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported auth method"));
                        process::exit(2);
                    }
                };
            } else if name == "--psk" {
                match value.split_once(':') {
                    Some((id, key)) if !id.is_empty() && !key.is_empty() => {
                        psk.add(id, key.as_bytes())
                    }
                    _ => fail_with_error(name, value, format_args!("Expected <ID>:<KEY>")),
                }
            } else if name == "--id" {
                match ikev1::policy::parse_identity(value) {
                    Ok(id) => local_id = Some(id),
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                }
            } else if name == "--peer-id" {
                match ikev1::policy::parse_identity(value) {
                    Ok(id) => peer_id = Some(id),
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                }
            } else if name == "--verify-id" {
                check(parse_bool(value).map(|value| verify_id = value));
            } else if name == "--cipher" {
                encryption = match value {
                    "aes128" => EncryptionAlgorithm::Aes(16),
                    "aes192" => EncryptionAlgorithm::Aes(24),
                    "aes256" => EncryptionAlgorithm::Aes(32),
                    "3des" => EncryptionAlgorithm::TripleDes,
                    "des" => EncryptionAlgorithm::Des,
                    "blowfish" => EncryptionAlgorithm::Blowfish(16),
                    "cast" => EncryptionAlgorithm::Cast(16),
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported cipher"));
                        process::exit(2);
                    }
                };
            } else if name == "--hash" {
                hash = match value {
                    "md5" => HashAlgorithm::Md5,
                    "sha1" => HashAlgorithm::Sha1,
                    "sha256" => HashAlgorithm::Sha256,
                    "sha384" => HashAlgorithm::Sha384,
                    "sha512" => HashAlgorithm::Sha512,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported hash"));
                        process::exit(2);
                    }
                };
            } else if name == "--dh-group" {
                check(parse_dh_group(value).map(|group| dh_group = group));
            } else if name == "--lifetime" {
                match u64::from_str(value) {
                    Ok(seconds) if seconds > 0 => lifetime = Duration::from_secs(seconds),
                    _ => fail_with_error(name, value, format_args!("Expected a number of seconds")),
                }
            } else if name == "--retry-count" {
                match usize::from_str(value) {
                    Ok(count) => retry_count = Some(count),
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                }
            } else if name == "--retry-interval" {
                match u64::from_str(value) {
                    Ok(seconds) if seconds > 0 => {
                        retry_interval = Some(Duration::from_secs(seconds))
                    }
                    _ => fail_with_error(name, value, format_args!("Expected a number of seconds")),
                }
            } else if name == "--passive" {
                check(parse_bool(value).map(|value| passive = value));
            } else if name == "--initial-contact" {
                check(parse_bool(value).map(|value| initial_contact = value));
            } else if name == "--cacert" {
                root_ca = Some(read_file(name, value));
            } else if name == "--cert" {
                public_cert = Some(read_file(name, value));
            } else if name == "--key" {
                private_key = Some(read_file(name, value));
            } else if name == "--peer-cert" {
                peer_cert = Some(read_file(name, value));
            } else if name == "--verify-cert" {
                check(parse_bool(value).map(|value| verify_cert = value));
            } else if name == "--pfs-group" {
                check(parse_dh_group(value).map(|group| pfs_group = Some(group)));
            } else if name == "--local-net" {
                check(Subnet::parse(value).map(|subnet| local_net = Some(subnet)));
            } else if name == "--remote-net" {
                check(Subnet::parse(value).map(|subnet| remote_net = Some(subnet)));
            } else if name == "--esp-cipher" {
                esp_cipher = match value {
                    "aes128" => EspCipher::Aes(16),
                    "aes192" => EspCipher::Aes(24),
                    "aes256" => EspCipher::Aes(32),
                    "3des" => EspCipher::TripleDes,
                    "des" => EspCipher::Des,
                    "blowfish" => EspCipher::Blowfish(16),
                    "cast" => EspCipher::Cast(16),
                    "null" => EspCipher::Null,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported ESP cipher"));
                        process::exit(2);
                    }
                };
            } else if name == "--esp-auth" {
                esp_auth = match value {
                    "hmac-md5" => Some(IntegrityAlgorithm::HmacMd5),
                    "hmac-sha1" => Some(IntegrityAlgorithm::HmacSha1),
                    "hmac-sha256" => Some(IntegrityAlgorithm::HmacSha256),
                    "none" => None,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported ESP auth"));
                        process::exit(2);
                    }
                };
            } else if name == "--encapsulation" {
                encapsulation = match value {
                    "tunnel" => Encapsulation::Tunnel,
                    "transport" => Encapsulation::Transport,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported encapsulation"));
                        process::exit(2);
                    }
                };
            } else if name == "--pad-strict" {
                check(parse_bool(value).map(|value| padding.strict = value));
            } else if name == "--weak-keys" {
                weak_keys = match value {
                    "reject" => WeakKeyPolicy::Reject,
                    "allow" => WeakKeyPolicy::Allow,
                    _ => {
                        fail_with_error(name, value, format_args!("Unsupported weak key policy"));
                        process::exit(2);
                    }
                };
            } else {
                eprintln!("Unsupported argument {}", arg);
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };

        let connect = match action.as_str() {
            "serve" => false,
            "connect" => true,
            _ => {
                eprintln!("No action specified");
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            }
        };
        if listen_ips.is_empty() {
            listen_ips = vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
        }
        if esp_cipher == EspCipher::Null && esp_auth.is_none() {
            eprintln!("ESP needs either a cipher or authentication");
            process::exit(2);
        }
        let local_cert = match (public_cert, private_key) {
            (Some(public_cert), Some(private_key)) => Some((public_cert, private_key)),
            (None, None) => None,
            _ => {
                eprintln!("Both --cert and --key need to be specified");
                process::exit(2);
            }
        };
        if auth == AuthMethod::RsaSignature && local_cert.is_none() {
            eprintln!("Signature authentication needs --cert and --key");
            process::exit(2);
        }
        let acquire = if connect {
            let peer = if let Some(peer) = peer {
                peer
            } else {
                eprintln!("Connecting needs a --peer address");
                process::exit(2);
            };
            let local = listen_ips[0];
            if local.is_unspecified() && local_net.is_none() {
                eprintln!("Connecting from an unspecified address needs --local-net");
                process::exit(2);
            }
            Some(TrafficSelectors {
                local: local_net.unwrap_or_else(|| Subnet::host(local)),
                remote: remote_net.unwrap_or_else(|| Subnet::host(peer)),
            })
        } else {
            None
        };

        let mut remote = RemoteConfig::new(
            peer,
            vec![Phase1Proposal {
                encryption,
                hash,
                auth,
                dh_group,
                lifetime,
            }],
        );
        remote.exchange_mode = exchange_mode;
        remote.local_id = local_id;
        remote.peer_id = peer_id;
        remote.verify_identifier = verify_id;
        remote.passive = passive;
        remote.initial_contact = initial_contact;
        remote.verify_cert = verify_cert;
        if let Some(retry_count) = retry_count {
            remote.retry_count = retry_count;
        }
        if let Some(retry_interval) = retry_interval {
            remote.retry_interval = retry_interval;
        }
        let selectors = match (local_net, remote_net) {
            (Some(local), Some(remote)) => Some(TrafficSelectors { local, remote }),
            _ => None,
        };
        let sainfo = Sainfo {
            selectors,
            transforms: vec![IpsecTransform::esp(esp_cipher, esp_auth)],
            encapsulation,
            pfs_group,
            lifetime: ikev1::policy::DEFAULT_LIFETIME,
        };

        let action = Action::Serve(ikev1::Config {
            listen_ips,
            port,
            remote,
            sainfo,
            psk,
            root_ca,
            local_cert,
            peer_cert,
            padding,
            weak_keys,
            acquire,
        });
        Args { log_level, action }
    }
}

fn main() {
    println!(
        "ikev1d version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Serve(config) => {
            let server = match ikev1::Server::new(config) {
                Ok(server) => server,
                Err(err) => {
                    println!("Failed to create server, error is {}", err);
                    std::process::exit(1)
                }
            };
            if let Err(err) = server.run() {
                println!("Failed to run server, error is {}", err);
                std::process::exit(1);
            }
        }
    }
}
