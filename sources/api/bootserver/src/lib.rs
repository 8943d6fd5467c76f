/*!
# Boot Script Server

The boot script server collects all the information required to produce an
iPXE boot script for each node of a system.  The script is generated on
demand and delivered to the requesting node during an iPXE boot; the main
items it carries are the kernel image URL, the boot arguments, and the
initrd image URL.

Kernel and initrd images are named by URL or path.  A URL can point at any
service the iPXE client can reach; `s3://` references are rewritten to
presigned HTTPS URLs at script-build time.

Boot data is keyed by *bindings*: xnames, raw MAC addresses or `nid<N>`
names for nodes the inventory cannot resolve yet, role tags, and the
reserved `Default`, `Global` and `Unknown-<arch>` tags.  A bootscript
request resolves the most specific binding that applies to the requesting
node.
*/

#[macro_use]
extern crate log;

pub mod cloudinit;
pub mod config;
pub mod discovery;
pub mod error;
pub mod images;
pub mod inventory;
pub mod model;
pub mod s3url;
pub mod script;
pub mod server;
pub mod spire;
pub mod store;
