//! The built-in property schema. One line per settable path:
//! `path value-type access-level`. Segments of the form `%type%` match any
//! concrete segment the named type accepts; stub tokens (see
//! [`expand_stubs`](super::expand_stubs)) expand before insertion.

pub const DEFAULT_SCHEMA: &str = "\
# identity
@/apversion                               text          service
@/cfgversion                              int           internal
@/uuid                                    uuid          internal
@/site_index                              int           service
@/site/name                               text          admin
@/site/scheduled_backup/time              time          service
@/site/scheduled_backup/unit              time_unit     service

# networking
@/network/base_address                    cidr          service
@/network/ntp_servers                     list:dnsaddr  admin
@/network/dns_server                      ipoptport     admin
@/network/wan/current/address             cidr          service
@/network/wan/static/address              cidr          admin
@/network/wan/static/route                ipaddr        admin

# virtual APs: psk and eap share shape, guest is spelled out
@/network/vap/%auth_src%/ssid             ssid          admin
@/network/vap/%auth_src%/keymgmt          keymgmt       admin
@/network/vap/%auth_src%/passphrase       passphrase    admin
@/network/vap/%auth_src%/default_ring     ring          admin
@/network/vap/%auth_src%/rings            list:ring     admin
@/network/vap/guest/ssid                  ssid          admin
@/network/vap/guest/keymgmt               keymgmt       admin
@/network/vap/guest/passphrase            passphrase    admin
@/network/vap/guest/default_ring          ring          admin
@/network/vap/guest/rings                 list:ring     admin

# rings
@/rings/%ring%/subnet                     privatecidr   service
@/rings/%ring%/lease_duration             duration      admin
@/rings/%ring%/vap                        text          admin

# client records
@/clients/%macaddr%/ring                  ring          admin
@/clients/%macaddr%/home                  ring          admin
@/clients/%macaddr%/ipv4                  ipaddr        admin
@/clients/%macaddr%/ipv4_observed         ipaddr        service
@/clients/%macaddr%/dns_name              hostname      admin
@/clients/%macaddr%/dhcp_name             hostname      service
@/clients/%macaddr%/connection/vap        text          service
@/clients/%macaddr%/connection/band       wifiband      service
@/clients/%macaddr%/connection/node       nodeid        service
@/clients/%macaddr%/identity              text          service
@/clients/%macaddr%/confidence            float         service

# naming
@/dns/cnames/%hostname%                   dnsaddr       admin

# firewall
@/firewall/forwards/%port%/protocol       proto         admin
@/firewall/forwards/%port%/target         fwtarget      admin
@/firewall/rules/%text%/active            bool          admin
@/firewall/rules/%text%/rule              text          admin

# mesh nodes and their radios
@/nodes/%nodeid%/address                  sshaddr       service
@/nodes/%nodeid%/state                    nicstate      service
@/nodes/%nodeid%/nics/%nic%/state         nicstate      service
@/nodes/%nodeid%/nics/%nic%/band          wifiband      service
@/nodes/%nodeid%/nics/%nic%/width         wifiwidth     service

# device database projection (served read-only)
@/devices/%macaddr%/vendor                text          service
@/devices/%macaddr%/model                 text          service
@/devices/%macaddr%/kind                  text          service

# per-source policy
@/policy/%policy_src%/vpn/enabled         bool          admin
@/policy/%policy_src%/scans/active        bool          service

# site users
@/users/%uuid%/email                      text          admin
@/users/%uuid%/telephone                  text          admin
@/users/%uuid%/self_provisioned           bool          service

# software update state
@/updates/available                       tribool       service
@/updates/checked                         time          service

# scratch space for short-lived properties
@/tmp/%text%                              text          admin
";
