//! Topology declaration, naming and endpoint derivation.

use cluster::topology::{NodeDecl, Role, Topology, TopologyError};

fn decl(address: &str, role: Role) -> NodeDecl {
    NodeDecl::new(address, "ubuntu", role)
}

#[test]
fn test_names_assigned_per_role_in_declaration_order() {
    let topology = Topology::declare(
        &[
            decl("10.0.0.20", Role::Worker),
            decl("10.0.0.10", Role::ControlPlane),
            decl("10.0.0.21", Role::Worker),
            decl("10.0.0.11", Role::ControlPlane),
            decl("10.0.0.5", Role::LoadBalancer),
        ],
        6443,
    )
    .unwrap();

    let names: Vec<&str> = topology.nodes().iter().map(|n| n.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "worker01",
            "controlplane01",
            "worker02",
            "controlplane02",
            "loadbalancer01"
        ]
    );

    let workers: Vec<&str> = topology
        .hosts_for_role(Role::Worker)
        .into_iter()
        .map(|n| n.address.as_str())
        .collect();
    assert_eq!(workers, vec!["10.0.0.20", "10.0.0.21"]);
    assert_eq!(topology.primary_control_plane().unwrap().name, "controlplane01");
}

#[test]
fn test_endpoint_is_load_balancer_when_present() {
    let topology = Topology::declare(
        &[
            decl("10.0.0.10", Role::ControlPlane),
            decl("10.0.0.11", Role::ControlPlane),
            decl("10.0.0.5", Role::LoadBalancer),
        ],
        6443,
    )
    .unwrap();

    let endpoint = topology.control_plane_endpoint();
    assert_eq!(endpoint.host, "10.0.0.5");
    assert_eq!(endpoint.to_string(), "10.0.0.5:6443");
}

#[test]
fn test_endpoint_is_single_control_plane_without_load_balancer() {
    let topology = Topology::declare(&[decl("192.168.1.10", Role::ControlPlane)], 8443).unwrap();
    assert_eq!(topology.control_plane_endpoint().to_string(), "192.168.1.10:8443");
    assert!(!topology.has_load_balancer());
}

#[test]
fn test_ipv6_endpoint_is_bracketed() {
    let topology = Topology::declare(&[decl("fd00::10", Role::ControlPlane)], 6443).unwrap();
    assert_eq!(topology.control_plane_endpoint().to_string(), "[fd00::10]:6443");
}

#[test]
fn test_rejects_missing_control_plane() {
    let err = Topology::declare(&[decl("10.0.0.20", Role::Worker)], 6443).unwrap_err();
    assert_eq!(err, TopologyError::NoControlPlane);
}

#[test]
fn test_rejects_multiple_control_planes_without_load_balancer() {
    let err = Topology::declare(
        &[
            decl("10.0.0.10", Role::ControlPlane),
            decl("10.0.0.11", Role::ControlPlane),
        ],
        6443,
    )
    .unwrap_err();
    assert_eq!(err, TopologyError::MissingLoadBalancer { control_planes: 2 });
}

#[test]
fn test_rejects_second_load_balancer() {
    let err = Topology::declare(
        &[
            decl("10.0.0.10", Role::ControlPlane),
            decl("10.0.0.5", Role::LoadBalancer),
            decl("10.0.0.6", Role::LoadBalancer),
        ],
        6443,
    )
    .unwrap_err();
    assert_eq!(err, TopologyError::MultipleLoadBalancers(2));
}

#[test]
fn test_rejects_duplicate_and_empty_addresses() {
    let err = Topology::declare(
        &[
            decl("10.0.0.10", Role::ControlPlane),
            decl("10.0.0.10", Role::Worker),
        ],
        6443,
    )
    .unwrap_err();
    assert_eq!(err, TopologyError::DuplicateAddress("10.0.0.10".to_string()));

    let err = Topology::declare(
        &[decl("10.0.0.10", Role::ControlPlane), decl("  ", Role::Worker)],
        6443,
    )
    .unwrap_err();
    assert_eq!(err, TopologyError::EmptyAddress { index: 1 });
}

#[test]
fn test_rejects_empty_principal() {
    let err = Topology::declare(
        &[NodeDecl::new("10.0.0.10", "", Role::ControlPlane)],
        6443,
    )
    .unwrap_err();
    assert_eq!(
        err,
        TopologyError::EmptyPrincipal {
            address: "10.0.0.10".to_string()
        }
    );
}

#[test]
fn test_role_parsing_accepts_common_spellings() {
    assert_eq!("control-plane".parse::<Role>().unwrap(), Role::ControlPlane);
    assert_eq!("master".parse::<Role>().unwrap(), Role::ControlPlane);
    assert_eq!("LB".parse::<Role>().unwrap(), Role::LoadBalancer);
    assert_eq!("load_balancer".parse::<Role>().unwrap(), Role::LoadBalancer);
    assert!("etcd".parse::<Role>().is_err());
}
