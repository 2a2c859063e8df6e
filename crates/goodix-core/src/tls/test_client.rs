//! OpenSSL PSK client playing the sensor's side of the tunnel in tests.

use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};

use super::pipe::{PipeEnd, PipeSignal};
use crate::protocol::constants::TLS_PSK_LEN;

const TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct PskClient {
    to_client: Sender<Vec<u8>>,
    from_client: Receiver<PipeSignal>,
    payloads: Option<Sender<Vec<u8>>>,
    written: Receiver<()>,
    fed: usize,
    thread: Option<JoinHandle<()>>,
}

impl PskClient {
    /// Start a client; it sends its ClientHello right away.
    pub(crate) fn spawn() -> Self {
        let (to_client, client_in) = mpsc::channel();
        let (client_out, from_client) = mpsc::channel();
        let (payloads_tx, payloads_rx) = mpsc::channel::<Vec<u8>>();
        let (written_tx, written) = mpsc::channel();
        let pipe = PipeEnd::<PipeSignal>::new(client_in, client_out);

        let thread = thread::spawn(move || {
            let mut builder = SslContextBuilder::new(SslMethod::tls()).unwrap();
            builder
                .set_min_proto_version(Some(SslVersion::TLS1_2))
                .unwrap();
            builder
                .set_max_proto_version(Some(SslVersion::TLS1_2))
                .unwrap();
            builder.set_cipher_list("PSK").unwrap();
            builder.set_verify(SslVerifyMode::NONE);
            builder.set_psk_client_callback(|_ssl, _hint, identity, psk| {
                let name = b"Client_identity\0";
                identity[..name.len()].copy_from_slice(name);
                psk[..TLS_PSK_LEN].fill(0);
                Ok(TLS_PSK_LEN)
            });
            let ctx = builder.build();
            let Ok(mut stream) = Ssl::new(&ctx).unwrap().connect(pipe) else {
                return;
            };
            while let Ok(payload) = payloads_rx.recv() {
                stream.write_all(&payload).unwrap();
                written_tx.send(()).unwrap();
            }
        });

        Self {
            to_client,
            from_client,
            payloads: Some(payloads_tx),
            written,
            fed: 0,
            thread: Some(thread),
        }
    }

    /// Deliver server bytes to the client.
    pub(crate) fn send(&mut self, bytes: &[u8]) {
        self.to_client.send(bytes.to_vec()).unwrap();
        self.fed += 1;
    }

    /// Everything the client writes until it waits for the server again.
    pub(crate) fn flight(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match self.from_client.recv_timeout(TIMEOUT).unwrap() {
                PipeSignal::Data(bytes) => out.extend(bytes),
                PipeSignal::Drained { consumed } if consumed == self.fed => return out,
                PipeSignal::Drained { .. } => {}
            }
        }
    }

    /// Encrypt `data` once the handshake has completed; returns the records.
    pub(crate) fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        self.payloads
            .as_ref()
            .unwrap()
            .send(data.to_vec())
            .unwrap();
        self.written.recv_timeout(TIMEOUT).unwrap();
        self.from_client
            .try_iter()
            .filter_map(|signal| match signal {
                PipeSignal::Data(bytes) => Some(bytes),
                PipeSignal::Drained { .. } => None,
            })
            .flatten()
            .collect()
    }
}

impl Drop for PskClient {
    fn drop(&mut self) {
        self.payloads = None;
        // Closing the input unblocks a client still inside the handshake.
        let (closed, _) = mpsc::channel();
        self.to_client = closed;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
